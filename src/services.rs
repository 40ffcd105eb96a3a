use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{LoadBalancerIngress, Node, ObjectReference, Secret, Service},
    serde_json::{json, Value},
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{controller::Action, events::EventType},
    Api, Resource, ResourceExt,
};

use crate::{
    consts,
    error::{CCMError, CCMResult},
    events::{actions, reasons, EventPublisher},
    finalizers,
    lb::{
        desired::{self, default_label},
        DesiredService, IdentityStore, TlsMaterial,
    },
    linode::models::{BalancerId, NodeBalancer},
    retry::RetryPolicy,
    CurrentContext,
};

/// Reconcile the service.
/// This function is called by the controller for each service.
/// It will create or update the NodeBalancer based on the service.
/// If the service is being deleted, it will clean up the resources.
#[tracing::instrument(skip(svc, context), fields(service = svc.name_any()))]
pub async fn reconcile_service(
    svc: Arc<Service>,
    context: Arc<CurrentContext>,
) -> CCMResult<Action> {
    let result = reconcile_inner(&svc, &context).await;
    if let Err(err) = &result {
        report_error(context.events.as_ref(), &svc.object_ref(&()), err).await;
    }
    result
}

async fn reconcile_inner(svc: &Service, context: &CurrentContext) -> CCMResult<Action> {
    if !is_load_balancer(svc) {
        if finalizers::check(svc) {
            tracing::info!("Service is no longer a LoadBalancer. Cleaning up resources.");
            cleanup(svc, context).await?;
            forget_balancer(svc, context).await?;
            finalizers::remove(context.client.clone(), svc).await?;
            return Ok(Action::await_change());
        }
        tracing::debug!("Service type is not LoadBalancer. Skipping...");
        return Err(CCMError::SkipService);
    }

    // If the service is being deleted, we need to clean up the resources.
    if svc.meta().deletion_timestamp.is_some() {
        tracing::info!("Service deletion detected. Cleaning up resources.");
        cleanup(svc, context).await?;
        finalizers::remove(context.client.clone(), svc).await?;
        return Ok(Action::await_change());
    }

    // Add finalizer if it's not there yet.
    if !finalizers::check(svc) {
        finalizers::add(context.client.clone(), svc).await?;
    }

    reconcile_load_balancer(svc, context).await
}

#[must_use]
pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .unwrap_or("ClusterIP")
        == "LoadBalancer"
}

async fn reconcile_load_balancer(svc: &Service, context: &CurrentContext) -> CCMResult<Action> {
    let filter = desired::node_filter(svc)?;
    let nodes = Api::<Node>::all(context.client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let backends = desired::select_backends(&nodes, filter.as_ref());
    if backends.is_empty() {
        tracing::warn!("No ready nodes with a private address match the service");
    }
    let tls = fetch_tls_secrets(svc, context).await?;
    let desired = DesiredService::build(svc, &context.config, &backends, &tls)?;

    let svc_api = service_api(svc, context);
    let identity = ServiceIdentity {
        api: svc_api.clone(),
        name: svc.name_any(),
        retry: context.config.api_retry_policy(),
    };
    let report = context.engine.reconcile(&desired, &identity).await?;
    tracing::info!(
        balancer = report.balancer.id,
        created = report.created,
        mutations = report.mutations,
        "NodeBalancer is in sync"
    );

    let ingress = ingress_status(&report.balancer);
    if needs_status_update(svc, &ingress) {
        svc_api
            .patch_status(
                svc.name_any().as_str(),
                &PatchParams::default(),
                &Patch::Merge(json!({
                    "status": {
                        "loadBalancer": {
                            "ingress": ingress
                        }
                    }
                })),
            )
            .await?;
    }

    if report.mutations > 0 {
        context
            .events
            .publish(
                &svc.object_ref(&()),
                EventType::Normal,
                reasons::ENSURED_LOAD_BALANCER,
                actions::RECONCILE,
                Some(format!(
                    "NodeBalancer {} ensured with {} change(s)",
                    report.balancer.id, report.mutations
                )),
            )
            .await;
    }

    Ok(Action::requeue(context.config.requeue_interval()))
}

/// Delete the NodeBalancer of the service, if it has one.
async fn cleanup(svc: &Service, context: &CurrentContext) -> CCMResult<()> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let label = svc
        .annotations()
        .get(consts::LB_LABEL_ANN_NAME)
        .cloned()
        .unwrap_or_else(|| default_label(&namespace, &svc.name_any()));
    let deleted = context
        .engine
        .delete(persisted_balancer_id(svc), &label)
        .await?;
    if let Some(id) = deleted {
        context
            .events
            .publish(
                &svc.object_ref(&()),
                EventType::Normal,
                reasons::DELETED_LOAD_BALANCER,
                actions::DELETE,
                Some(format!("NodeBalancer {id} deleted")),
            )
            .await;
    }
    Ok(())
}

/// Drop the identity annotations and ingress status of a service that
/// stopped being a LoadBalancer.
async fn forget_balancer(svc: &Service, context: &CurrentContext) -> CCMResult<()> {
    let api = service_api(svc, context);
    let name = svc.name_any();
    let annotations = svc.annotations();
    if annotations.contains_key(consts::LB_BALANCER_ID_ANN_NAME)
        || annotations.contains_key(consts::LB_TLS_DIGESTS_ANN_NAME)
    {
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": {
                    "annotations": {
                        (consts::LB_BALANCER_ID_ANN_NAME): null,
                        (consts::LB_TLS_DIGESTS_ANN_NAME): null
                    }
                }
            })),
        )
        .await?;
    }
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "status": {
                "loadBalancer": {
                    "ingress": null
                }
            }
        })),
    )
    .await?;
    Ok(())
}

/// Identity annotation of a service. Unparseable values are ignored here,
/// the desired state build reports them.
fn persisted_balancer_id(svc: &Service) -> Option<BalancerId> {
    svc.annotations()
        .get(consts::LB_BALANCER_ID_ANN_NAME)
        .and_then(|id| id.trim().parse().ok())
}

fn service_api(svc: &Service, context: &CurrentContext) -> Api<Service> {
    Api::<Service>::namespaced(
        context.client.clone(),
        svc.namespace()
            .unwrap_or_else(|| context.client.default_namespace().to_string())
            .as_str(),
    )
}

/// Load the TLS material referenced by the port annotations.
/// Missing secrets are left out and reported by the desired state build.
async fn fetch_tls_secrets(
    svc: &Service,
    context: &CurrentContext,
) -> CCMResult<BTreeMap<String, TlsMaterial>> {
    let names = desired::tls_secret_names(svc)?;
    if names.is_empty() {
        return Ok(BTreeMap::new());
    }
    let secrets = Api::<Secret>::namespaced(
        context.client.clone(),
        svc.namespace()
            .unwrap_or_else(|| context.client.default_namespace().to_string())
            .as_str(),
    );
    let mut materials = BTreeMap::new();
    for name in names {
        let Some(secret) = secrets.get_opt(&name).await? else {
            tracing::warn!("TLS secret {} was not found", name);
            continue;
        };
        if let Some(material) = tls_from_secret(&secret)? {
            materials.insert(name, material);
        }
    }
    Ok(materials)
}

fn tls_from_secret(secret: &Secret) -> CCMResult<Option<TlsMaterial>> {
    let Some(data) = &secret.data else {
        return Ok(None);
    };
    let field = |key: &str| {
        data.get(key)
            .map(|value| {
                String::from_utf8(value.0.clone()).map_err(|_| {
                    CCMError::Validation(format!(
                        "secret {} has a non UTF-8 {key}",
                        secret.name_any()
                    ))
                })
            })
            .transpose()
    };
    match (
        field(consts::TLS_SECRET_CERT_KEY)?,
        field(consts::TLS_SECRET_KEY_KEY)?,
    ) {
        (Some(cert), Some(key)) => Ok(Some(TlsMaterial::new(cert, key))),
        _ => Ok(None),
    }
}

#[must_use]
pub fn ingress_status(balancer: &NodeBalancer) -> Vec<LoadBalancerIngress> {
    if balancer.ipv4.is_none() && balancer.hostname.is_none() {
        return Vec::new();
    }
    vec![LoadBalancerIngress {
        ip: balancer.ipv4.clone(),
        hostname: balancer.hostname.clone(),
        ..Default::default()
    }]
}

fn needs_status_update(svc: &Service, ingress: &[LoadBalancerIngress]) -> bool {
    if ingress.is_empty() {
        return false;
    }
    let current = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default();
    current != ingress
}

/// Persists the balancer id as an annotation on the service.
struct ServiceIdentity {
    api: Api<Service>,
    name: String,
    retry: RetryPolicy,
}

impl ServiceIdentity {
    async fn annotate(&self, operation: &str, key: &str, value: Value) -> CCMResult<()> {
        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": {
                    (key): value
                }
            }
        }));
        let params = PatchParams::default();
        let (api, name, patch, params) = (&self.api, self.name.as_str(), &patch, &params);
        self.retry
            .run(operation, move || api.patch(name, params, patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for ServiceIdentity {
    async fn persist_balancer_id(&self, id: BalancerId) -> CCMResult<()> {
        self.annotate(
            "persist_balancer_id",
            consts::LB_BALANCER_ID_ANN_NAME,
            Value::String(id.to_string()),
        )
        .await?;
        tracing::info!(balancer = id, "NodeBalancer id recorded on the service");
        Ok(())
    }

    async fn persist_tls_digests(&self, digests: &BTreeMap<u16, String>) -> CCMResult<()> {
        let value = if digests.is_empty() {
            Value::Null
        } else {
            Value::String(serde_json::to_string(digests)?)
        };
        self.annotate("persist_tls_digests", consts::LB_TLS_DIGESTS_ANN_NAME, value)
            .await?;
        tracing::debug!(ports = digests.len(), "TLS digests recorded on the service");
        Ok(())
    }
}

/// Surface a failed reconcile on the service.
pub async fn report_error(
    events: &dyn EventPublisher,
    resource_ref: &ObjectReference,
    err: &CCMError,
) {
    let reason = match err {
        CCMError::SkipService => return,
        err if err.is_validation() => reasons::INVALID_CONFIGURATION,
        _ => reasons::SYNC_FAILED,
    };
    events
        .publish(
            resource_ref,
            EventType::Warning,
            reason,
            actions::RECONCILE,
            Some(err.to_string()),
        )
        .await;
}

/// Validation failures wait for the service to change, everything else is
/// retried on the regular interval.
#[must_use]
pub fn error_action(error: &CCMError, requeue: Duration) -> Action {
    match error {
        CCMError::SkipService => Action::await_change(),
        err if err.is_validation() => Action::await_change(),
        _ => Action::requeue(requeue),
    }
}

/// Handle the error during reconcilation.
#[allow(clippy::needless_pass_by_value)]
pub fn on_error(_: Arc<Service>, error: &CCMError, context: Arc<CurrentContext>) -> Action {
    error_action(error, context.config.requeue_interval())
}
