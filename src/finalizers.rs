use k8s_openapi::{api::core::v1::Service, serde_json::json};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};

use crate::{
    consts,
    error::{CCMError, CCMResult},
};

/// Add our finalizer to the service, keeping any finalizers already set.
/// The NodeBalancer outlives the service until the finalizer is removed.
pub async fn add(client: Client, svc: &Service) -> CCMResult<()> {
    let api = Api::<Service>::namespaced(
        client,
        svc.namespace().ok_or(CCMError::SkipService)?.as_str(),
    );
    let mut finalizers = svc.finalizers().to_vec();
    finalizers.push(consts::FINALIZER_NAME.to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        svc.name_any().as_str(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

/// Check if service has the finalizer.
#[must_use]
pub fn check(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == consts::FINALIZER_NAME)
}

/// Remove finalizer from the service.
/// This will allow the service to be deleted.
///
/// if service does not have the finalizer, this function will do nothing.
pub async fn remove(client: Client, svc: &Service) -> CCMResult<()> {
    if !check(svc) {
        return Ok(());
    }
    let api = Api::<Service>::namespaced(
        client,
        svc.namespace().ok_or(CCMError::SkipService)?.as_str(),
    );
    let finalizers = svc
        .finalizers()
        .iter()
        .filter(|item| item.as_str() != consts::FINALIZER_NAME)
        .collect::<Vec<_>>();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        svc.name_any().as_str(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}
