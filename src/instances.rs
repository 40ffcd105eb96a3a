//! Cluster node ↔ Linode instance resolution and the node metadata
//! controller built on it.

use std::{net::Ipv4Addr, sync::Arc};

use k8s_openapi::api::core::v1::{Node, NodeAddress};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, ResourceExt,
};
use serde_json::{json, Map, Value};

use crate::{
    consts,
    error::{CCMError, CCMResult},
    lb::call,
    linode::{
        models::{Instance, InstanceId, InstanceStatus},
        Filter, LinodeApi,
    },
    retry::RetryPolicy,
    CurrentContext,
};

/// `linode://123` → `123`.
pub fn parse_provider_id(provider_id: &str) -> CCMResult<InstanceId> {
    provider_id
        .strip_prefix(consts::PROVIDER_ID_PREFIX)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| CCMError::InvalidProviderId(provider_id.to_string()))
}

#[must_use]
pub fn provider_id(id: InstanceId) -> String {
    format!("{}{id}", consts::PROVIDER_ID_PREFIX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMetadata {
    pub provider_id: String,
    pub instance_type: String,
    pub region: String,
    pub addresses: Vec<NodeAddress>,
}

impl TryFrom<&Instance> for InstanceMetadata {
    type Error = CCMError;

    fn try_from(instance: &Instance) -> Result<Self, Self::Error> {
        if instance.ipv4.is_empty() {
            return Err(CCMError::InstanceNoAddresses(instance.id));
        }
        let mut addresses = vec![NodeAddress {
            type_: "Hostname".to_string(),
            address: instance.label.clone(),
        }];
        addresses.extend(instance.ipv4.iter().map(|ip| {
            let private = ip.parse::<Ipv4Addr>().is_ok_and(|ip| ip.is_private());
            NodeAddress {
                type_: if private { "InternalIP" } else { "ExternalIP" }.to_string(),
                address: ip.clone(),
            }
        }));
        Ok(Self {
            provider_id: provider_id(instance.id),
            instance_type: instance.instance_type.clone(),
            region: instance.region.clone(),
            addresses,
        })
    }
}

/// Maps cluster nodes to Linode instances.
pub struct InstanceResolver {
    api: Arc<dyn LinodeApi>,
    retry: RetryPolicy,
}

impl InstanceResolver {
    #[must_use]
    pub fn new(api: Arc<dyn LinodeApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Find the instance behind a node: by provider id when the node has
    /// one, otherwise by an instance labelled with the node name.
    pub async fn lookup(&self, node: &Node) -> CCMResult<Option<Instance>> {
        let api = self.api.as_ref();
        if let Some(provider_id) = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .filter(|id| !id.is_empty())
        {
            let id = parse_provider_id(provider_id)?;
            return match call(&self.retry, "get_instance", move || api.get_instance(id)).await {
                Ok(instance) => Ok(Some(instance)),
                Err(CCMError::LinodeError(err)) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            };
        }

        let name = node.name_any();
        let filter = Filter::label(name.clone());
        let filter = &filter;
        let mut found = call(&self.retry, "list_instances", move || {
            api.list_instances(filter)
        })
        .await?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(CCMError::Validation(format!(
                "{n} instances are labelled {name}"
            ))),
        }
    }

    pub async fn exists(&self, node: &Node) -> CCMResult<bool> {
        Ok(self.lookup(node).await?.is_some())
    }

    pub async fn shutdown(&self, node: &Node) -> CCMResult<bool> {
        let instance = self
            .lookup(node)
            .await?
            .ok_or_else(|| CCMError::InstanceNotFound(node.name_any()))?;
        Ok(matches!(
            instance.status,
            InstanceStatus::Offline | InstanceStatus::ShuttingDown
        ))
    }

    pub async fn metadata(&self, node: &Node) -> CCMResult<InstanceMetadata> {
        let instance = self
            .lookup(node)
            .await?
            .ok_or_else(|| CCMError::InstanceNotFound(node.name_any()))?;
        InstanceMetadata::try_from(&instance)
    }

    /// Metadata to write onto the node, or `None` when the node should be
    /// left alone: its instance is gone or shut down.
    pub async fn node_target(&self, node: &Node) -> CCMResult<Option<InstanceMetadata>> {
        if !self.exists(node).await? {
            tracing::warn!("No Linode instance found for node {}", node.name_any());
            return Ok(None);
        }
        if self.shutdown(node).await? {
            tracing::info!("Linode instance is shut down, leaving node {} as is", node.name_any());
            return Ok(None);
        }
        match self.metadata(node).await {
            Ok(metadata) => Ok(Some(metadata)),
            // Deleted between the calls.
            Err(CCMError::InstanceNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Merge patch for the node object, if anything differs.
/// The provider id is immutable and only written when empty.
#[must_use]
pub fn node_patch(node: &Node, metadata: &InstanceMetadata) -> Option<Value> {
    let mut patch = json!({});
    let current_id = node
        .spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .unwrap_or_default();
    if current_id.is_empty() {
        patch["spec"] = json!({ "providerID": metadata.provider_id });
    } else if current_id != metadata.provider_id {
        tracing::warn!(
            current = current_id,
            resolved = %metadata.provider_id,
            "Node provider id does not match the resolved instance"
        );
    }

    let labels = node.labels();
    let mut wanted = Map::new();
    for (key, value) in [
        (consts::INSTANCE_TYPE_LABEL, &metadata.instance_type),
        (consts::REGION_LABEL, &metadata.region),
    ] {
        if labels.get(key) != Some(value) {
            wanted.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    if !wanted.is_empty() {
        patch["metadata"] = json!({ "labels": wanted });
    }

    patch
        .as_object()
        .is_some_and(|fields| !fields.is_empty())
        .then_some(patch)
}

fn addresses_differ(node: &Node, metadata: &InstanceMetadata) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default()
        != metadata.addresses.as_slice()
}

/// Keep provider id, topology labels and addresses of a node in sync
/// with its instance.
#[tracing::instrument(skip(node, context), fields(node = %node.name_any()))]
pub async fn reconcile_node(node: Arc<Node>, context: Arc<CurrentContext>) -> CCMResult<Action> {
    let requeue = Action::requeue(context.config.requeue_interval());
    let Some(metadata) = context.instances.node_target(&node).await? else {
        return Ok(requeue);
    };

    let api = Api::<Node>::all(context.client.clone());
    let name = node.name_any();
    if let Some(patch) = node_patch(&node, &metadata) {
        api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        tracing::info!("Node metadata updated");
    }
    if addresses_differ(&node, &metadata) {
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "status": {
                    "addresses": metadata.addresses
                }
            })),
        )
        .await?;
        tracing::info!("Node addresses updated");
    }
    Ok(requeue)
}

#[allow(clippy::needless_pass_by_value)]
pub fn on_error(_: Arc<Node>, error: &CCMError, context: Arc<CurrentContext>) -> Action {
    tracing::warn!("Node reconcile failed: {}", error);
    Action::requeue(context.config.requeue_interval())
}
