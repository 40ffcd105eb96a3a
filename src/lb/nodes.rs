use std::collections::{BTreeMap, HashSet};

use crate::{
    error::CCMResult,
    index::SharedIndex,
    linode::{
        models::{BalancerId, ConfigId, NodeBalancerNode, NodeCreateOptions, NodeId, NodeMode},
        LinodeApi,
    },
    retry::RetryPolicy,
};

use super::{call, ignore_not_found};

/// Backend entry a config should carry. Nodes are identified by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredNode {
    pub address: String,
    pub label: String,
    pub weight: i32,
    pub mode: NodeMode,
}

impl DesiredNode {
    #[must_use]
    pub fn create_options(&self) -> NodeCreateOptions {
        NodeCreateOptions {
            address: self.address.clone(),
            label: self.label.clone(),
            weight: self.weight,
            mode: self.mode,
        }
    }

    fn matches(&self, node: &NodeBalancerNode) -> bool {
        self.address == node.address
            && self.label == node.label
            && self.weight == node.weight
            && self.mode == node.mode
    }
}

/// Minimal set of node operations that turns the observed list into the
/// desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePlan {
    pub create: Vec<NodeCreateOptions>,
    /// Same address, different attributes. Nodes cannot be updated, so the
    /// old node is deleted before its replacement is created.
    pub replace: Vec<(NodeId, NodeCreateOptions)>,
    pub delete: Vec<NodeId>,
}

impl NodePlan {
    #[must_use]
    pub fn len(&self) -> usize {
        self.create.len() + self.replace.len() * 2 + self.delete.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the node plan for one config.
///
/// Observed nodes sharing an address are duplicates: the lowest id is kept
/// and the rest are deleted.
#[must_use]
pub fn plan(desired: &[DesiredNode], observed: &[NodeBalancerNode]) -> NodePlan {
    let wanted = desired
        .iter()
        .map(|node| (node.address.as_str(), node))
        .collect::<BTreeMap<_, _>>();

    let mut observed = observed.iter().collect::<Vec<_>>();
    observed.sort_by_key(|node| node.id);

    let mut plan = NodePlan::default();
    let mut seen = HashSet::new();
    for node in observed {
        if !seen.insert(node.address.as_str()) {
            plan.delete.push(node.id);
            continue;
        }
        match wanted.get(node.address.as_str()) {
            Some(want) if want.matches(node) => {}
            Some(want) => plan.replace.push((node.id, want.create_options())),
            None => plan.delete.push(node.id),
        }
    }
    plan.create = wanted
        .values()
        .filter(|node| !seen.contains(node.address.as_str()))
        .map(|node| node.create_options())
        .collect();
    plan
}

/// Converges the node list of a single config.
pub struct NodeSetSync<'a, A: LinodeApi + ?Sized> {
    pub api: &'a A,
    pub retry: &'a RetryPolicy,
    pub index: &'a SharedIndex,
}

impl<A: LinodeApi + ?Sized> NodeSetSync<'_, A> {
    /// Returns the number of mutating calls issued.
    pub async fn sync(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        desired: &[DesiredNode],
    ) -> CCMResult<usize> {
        let api = self.api;
        let observed = call(self.retry, "list_nodes", move || {
            api.list_nodes(balancer, config)
        })
        .await?;
        let ids = observed.iter().map(|node| node.id).collect::<Vec<_>>();
        self.index.with(|index| index.sync_nodes(config, &ids));

        let plan = plan(desired, &observed);
        if plan.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            config,
            create = plan.create.len(),
            replace = plan.replace.len(),
            delete = plan.delete.len(),
            "Updating nodes"
        );

        for options in &plan.create {
            self.create(balancer, config, options).await?;
        }
        for (node, options) in &plan.replace {
            self.delete(balancer, config, *node).await?;
            self.create(balancer, config, options).await?;
        }
        for node in &plan.delete {
            self.delete(balancer, config, *node).await?;
        }
        Ok(plan.len())
    }

    async fn create(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &NodeCreateOptions,
    ) -> CCMResult<()> {
        let api = self.api;
        let node = call(self.retry, "create_node", move || {
            api.create_node(balancer, config, options)
        })
        .await?;
        tracing::debug!(node = node.id, address = %node.address, "Node created");
        self.index.with(|index| index.insert_node(config, node.id));
        Ok(())
    }

    async fn delete(&self, balancer: BalancerId, config: ConfigId, node: NodeId) -> CCMResult<()> {
        let api = self.api;
        ignore_not_found(
            call(self.retry, "delete_node", move || {
                api.delete_node(balancer, config, node)
            })
            .await,
        )?;
        tracing::debug!(node, "Node deleted");
        self.index.with(|index| index.remove_node(node));
        Ok(())
    }
}
