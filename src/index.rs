//! In-memory mirror of the balancer → config → node ownership graph.
//!
//! Every create and delete the controller issues is recorded here together
//! with the parent link, so cascading removals walk explicit children sets
//! instead of scanning remote collections.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use crate::linode::models::{BalancerId, ConfigId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigEntry {
    balancer: BalancerId,
    port: u16,
    nodes: BTreeSet<NodeId>,
    /// Digest of the TLS material last applied to this config.
    tls_digest: Option<String>,
}

/// Children removed by a cascading delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removed {
    pub configs: Vec<ConfigId>,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    balancers: HashMap<BalancerId, BTreeSet<ConfigId>>,
    configs: HashMap<ConfigId, ConfigEntry>,
    nodes: HashMap<NodeId, ConfigId>,
}

impl ResourceIndex {
    pub fn insert_balancer(&mut self, balancer: BalancerId) {
        self.balancers.entry(balancer).or_default();
    }

    #[must_use]
    pub fn contains_balancer(&self, balancer: BalancerId) -> bool {
        self.balancers.contains_key(&balancer)
    }

    /// Record a config under its balancer.
    ///
    /// A port maps to one config per balancer: another config already
    /// holding the port is dropped together with its nodes.
    pub fn insert_config(&mut self, balancer: BalancerId, config: ConfigId, port: u16) {
        if let Some(previous) = self.config_for_port(balancer, port) {
            if previous != config {
                self.remove_config(previous);
            }
        }
        if let Some(entry) = self.configs.get_mut(&config) {
            if entry.balancer == balancer {
                entry.port = port;
                return;
            }
            self.remove_config(config);
        }
        self.balancers.entry(balancer).or_default().insert(config);
        self.configs.insert(
            config,
            ConfigEntry {
                balancer,
                port,
                nodes: BTreeSet::new(),
                tls_digest: None,
            },
        );
    }

    /// Record a node under its config. Unknown configs are ignored.
    pub fn insert_node(&mut self, config: ConfigId, node: NodeId) -> bool {
        if !self.configs.contains_key(&config) {
            return false;
        }
        if let Some(previous) = self.nodes.insert(node, config) {
            if let Some(old) = self.configs.get_mut(&previous) {
                old.nodes.remove(&node);
            }
        }
        if let Some(entry) = self.configs.get_mut(&config) {
            entry.nodes.insert(node);
        }
        true
    }

    pub fn remove_node(&mut self, node: NodeId) -> bool {
        let Some(config) = self.nodes.remove(&node) else {
            return false;
        };
        if let Some(entry) = self.configs.get_mut(&config) {
            entry.nodes.remove(&node);
        }
        true
    }

    /// Drop a config and every node under it.
    pub fn remove_config(&mut self, config: ConfigId) -> Vec<NodeId> {
        let Some(entry) = self.configs.remove(&config) else {
            return Vec::new();
        };
        if let Some(configs) = self.balancers.get_mut(&entry.balancer) {
            configs.remove(&config);
        }
        for node in &entry.nodes {
            self.nodes.remove(node);
        }
        entry.nodes.into_iter().collect()
    }

    /// Drop a balancer and its whole subtree.
    pub fn remove_balancer(&mut self, balancer: BalancerId) -> Removed {
        let Some(configs) = self.balancers.remove(&balancer) else {
            return Removed::default();
        };
        let mut removed = Removed::default();
        for config in configs {
            removed.nodes.extend(self.remove_config(config));
            removed.configs.push(config);
        }
        removed
    }

    #[must_use]
    pub fn configs_of(&self, balancer: BalancerId) -> Vec<ConfigId> {
        self.balancers
            .get(&balancer)
            .map(|configs| configs.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn nodes_of(&self, config: ConfigId) -> Vec<NodeId> {
        self.configs
            .get(&config)
            .map(|entry| entry.nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn config_for_port(&self, balancer: BalancerId, port: u16) -> Option<ConfigId> {
        self.balancers.get(&balancer)?.iter().copied().find(|id| {
            self.configs
                .get(id)
                .is_some_and(|entry| entry.port == port)
        })
    }

    pub fn set_tls_digest(&mut self, config: ConfigId, digest: Option<String>) {
        if let Some(entry) = self.configs.get_mut(&config) {
            entry.tls_digest = digest;
        }
    }

    #[must_use]
    pub fn tls_digest(&self, config: ConfigId) -> Option<&str> {
        self.configs.get(&config)?.tls_digest.as_deref()
    }

    /// Align a balancer's configs with what the API reported.
    /// Known configs keep their node sets and TLS digests. When several
    /// configs share a port only the lowest id is recorded.
    pub fn sync_configs(&mut self, balancer: BalancerId, observed: &[(ConfigId, u16)]) {
        self.insert_balancer(balancer);
        let mut by_port = BTreeMap::new();
        for (config, port) in observed {
            by_port
                .entry(*port)
                .and_modify(|lowest: &mut ConfigId| *lowest = (*lowest).min(*config))
                .or_insert(*config);
        }
        let keep = by_port.values().copied().collect::<BTreeSet<_>>();
        for stale in self
            .configs_of(balancer)
            .into_iter()
            .filter(|id| !keep.contains(id))
        {
            self.remove_config(stale);
        }
        for (port, config) in by_port {
            self.insert_config(balancer, config, port);
        }
    }

    /// Align a config's nodes with what the API reported.
    pub fn sync_nodes(&mut self, config: ConfigId, observed: &[NodeId]) {
        if !self.configs.contains_key(&config) {
            return;
        }
        let keep = observed.iter().copied().collect::<BTreeSet<_>>();
        for stale in self
            .nodes_of(config)
            .into_iter()
            .filter(|id| !keep.contains(id))
        {
            self.remove_node(stale);
        }
        for node in observed {
            self.insert_node(config, *node);
        }
    }

    #[must_use]
    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Index shared between reconcile workers.
///
/// The lock is only taken inside [`SharedIndex::with`], so it never spans an
/// await point.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex(Arc<Mutex<ResourceIndex>>);

impl SharedIndex {
    pub fn with<R>(&self, f: impl FnOnce(&mut ResourceIndex) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
