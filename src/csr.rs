//! Auto-approval of kubelet serving certificate requests.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{
    api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition},
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kube::{api::PostParams, runtime::controller::Action, Api, ResourceExt};

use crate::{consts, error::CCMError, retry::RetryPolicy, CurrentContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request already carries a condition.
    AlreadyDecided,
    /// Wrong signer or requester.
    NotKubeletServing,
    Approve,
}

#[must_use]
pub fn decide(csr: &CertificateSigningRequest) -> Decision {
    let has_condition = csr
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| !conditions.is_empty());
    if has_condition {
        return Decision::AlreadyDecided;
    }
    let from_node = csr
        .spec
        .username
        .as_deref()
        .is_some_and(|user| user.starts_with(consts::NODE_USER_PREFIX));
    if csr.spec.signer_name != consts::KUBELET_SERVING_SIGNER || !from_node {
        return Decision::NotKubeletServing;
    }
    Decision::Approve
}

#[must_use]
pub fn approved_condition() -> CertificateSigningRequestCondition {
    let now = Time(Utc::now());
    CertificateSigningRequestCondition {
        type_: "Approved".to_string(),
        status: "True".to_string(),
        reason: Some("AutoApproved".to_string()),
        message: Some("Kubelet certificates are automatically approved.".to_string()),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

#[async_trait]
pub trait CsrApprover: Send + Sync {
    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<(), kube::Error>;
}

/// Writes the approval through the `approval` subresource.
pub struct KubeCsrApprover {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrApprover {
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CsrApprover for KubeCsrApprover {
    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<(), kube::Error> {
        let mut approved = csr.clone();
        approved
            .status
            .get_or_insert_with(Default::default)
            .conditions = Some(vec![approved_condition()]);
        let body = serde_json::to_vec(&approved).map_err(kube::Error::SerdeError)?;
        self.api
            .replace_subresource("approval", &csr.name_any(), &PostParams::default(), body)
            .await?;
        Ok(())
    }
}

/// Approve the request if it qualifies. Returns whether it was approved.
///
/// Failures are logged and dropped: the next event for the request is the
/// only retry after the policy gives up.
pub async fn handle_csr(
    csr: &CertificateSigningRequest,
    approver: &dyn CsrApprover,
    retry: &RetryPolicy,
) -> bool {
    let name = csr.name_any();
    match decide(csr) {
        Decision::AlreadyDecided => {
            tracing::debug!(csr = %name, "CSR already has a condition, skipping");
            return false;
        }
        Decision::NotKubeletServing => {
            tracing::debug!(csr = %name, "CSR is not a kubelet serving request, skipping");
            return false;
        }
        Decision::Approve => {}
    }
    let result = retry
        .run_observed(
            |attempt, err: &kube::Error| {
                tracing::warn!(csr = %name, attempt, error = %err, "CSR approval failed, retrying");
            },
            || approver.approve(csr),
        )
        .await;
    match result {
        Ok(()) => {
            tracing::info!(csr = %name, "CSR approved");
            true
        }
        Err(err) => {
            tracing::error!(csr = %name, error = %err, "Giving up on CSR approval");
            false
        }
    }
}

pub async fn reconcile_csr(
    csr: Arc<CertificateSigningRequest>,
    context: Arc<CurrentContext>,
) -> Result<Action, CCMError> {
    handle_csr(&csr, context.csr_approver.as_ref(), &context.csr_retry).await;
    Ok(Action::await_change())
}

#[allow(clippy::needless_pass_by_value)]
pub fn on_error(
    _: Arc<CertificateSigningRequest>,
    _error: &CCMError,
    _context: Arc<CurrentContext>,
) -> Action {
    Action::await_change()
}
