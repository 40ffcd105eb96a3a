//! In-memory Linode API for tests.
//!
//! Mirrors the provider's behaviour that reconciliation depends on: ids are
//! assigned by the server, deletes cascade, TLS material is redacted on
//! read, filters match exactly and nodes cannot be updated.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{
    models::{
        BalancerId, ConfigId, ConfigOptions, ConfigWithNodes, Instance, InstanceId, NodeBalancer,
        NodeBalancerConfig, NodeBalancerCreateOptions, NodeBalancerNode,
        NodeBalancerUpdateOptions, NodeCreateOptions, NodeId, Protocol, REDACTED,
    },
    Filter, LinodeApi, LinodeError, LinodeResult,
};
use crate::index::ResourceIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: &'static str,
    pub path: String,
}

impl Request {
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        self.method != "GET"
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    balancers: BTreeMap<BalancerId, NodeBalancer>,
    configs: BTreeMap<ConfigId, NodeBalancerConfig>,
    nodes: BTreeMap<NodeId, NodeBalancerNode>,
    instances: BTreeMap<InstanceId, Instance>,
    index: ResourceIndex,
    requests: Vec<Request>,
    failures: HashMap<&'static str, (u16, usize)>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        1000 + self.next_id
    }

    fn record(&mut self, operation: &'static str, method: &'static str, path: String) -> LinodeResult<()> {
        self.requests.push(Request { method, path });
        if let Some((status, remaining)) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinodeError::api(*status, format!("injected failure for {operation}")));
            }
        }
        Ok(())
    }

    fn config_entry(&self, balancer: BalancerId, config: ConfigId) -> LinodeResult<&NodeBalancerConfig> {
        self.configs
            .get(&config)
            .filter(|c| c.nodebalancer_id == balancer)
            .ok_or_else(LinodeError::not_found)
    }

    fn store_config(
        &mut self,
        balancer: BalancerId,
        id: ConfigId,
        options: &ConfigOptions,
    ) -> NodeBalancerConfig {
        check_tls(options);
        let config = NodeBalancerConfig {
            id,
            nodebalancer_id: balancer,
            port: options.port,
            protocol: options.protocol,
            proxy_protocol: options.proxy_protocol,
            algorithm: options.algorithm,
            stickiness: options.stickiness,
            check: options.check,
            check_interval: options.check_interval,
            check_timeout: options.check_timeout,
            check_attempts: options.check_attempts,
            check_path: options.check_path.clone().unwrap_or_default(),
            check_body: options.check_body.clone().unwrap_or_default(),
            check_passive: options.check_passive,
            cipher_suite: options.cipher_suite,
            ssl_commonname: String::new(),
            ssl_fingerprint: String::new(),
            ssl_cert: options.ssl_cert.as_ref().map(|_| REDACTED.to_string()),
            ssl_key: options.ssl_key.as_ref().map(|_| REDACTED.to_string()),
        };
        let stored = match self.configs.get(&id) {
            // In-place updates without TLS keep the stored material.
            Some(existing) if options.ssl_cert.is_none() => NodeBalancerConfig {
                ssl_cert: existing.ssl_cert.clone(),
                ssl_key: existing.ssl_key.clone(),
                ..config
            },
            _ => config,
        };
        self.index.insert_config(balancer, id, stored.port);
        self.configs.insert(id, stored.clone());
        stored
    }

    fn store_node(
        &mut self,
        balancer: BalancerId,
        config: ConfigId,
        options: &NodeCreateOptions,
    ) -> LinodeResult<NodeBalancerNode> {
        if self
            .nodes
            .values()
            .any(|n| n.config_id == config && n.address == options.address)
        {
            return Err(LinodeError::api(400, "address already in use by another node"));
        }
        let node = NodeBalancerNode {
            id: self.id(),
            config_id: config,
            nodebalancer_id: balancer,
            address: options.address.clone(),
            label: options.label.clone(),
            weight: options.weight,
            mode: options.mode,
            status: "UP".to_string(),
        };
        self.index.insert_node(config, node.id);
        self.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    fn drop_config(&mut self, config: ConfigId) {
        for node in self.index.remove_config(config) {
            self.nodes.remove(&node);
        }
        self.configs.remove(&config);
    }
}

/// Panics on TLS material the real API would reject, so tests fail loudly if
/// the controller ever sends it.
fn check_tls(options: &ConfigOptions) {
    if options.protocol != Protocol::Https {
        return;
    }
    if let Some(cert) = &options.ssl_cert {
        assert!(cert.contains("BEGIN CERTIFICATE"), "https config sent with an invalid certificate");
    }
    if let Some(key) = &options.ssl_key {
        assert!(key.contains("PRIVATE KEY"), "https config sent with an invalid key");
    }
}

#[derive(Debug, Default)]
pub struct FakeLinode {
    state: Mutex<State>,
}

impl FakeLinode {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` with `status`.
    pub fn fail(&self, operation: &'static str, status: u16, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation, (status, times));
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.id, instance);
    }

    /// Insert a balancer behind the controller's back.
    pub fn seed_balancer(&self, label: &str) -> NodeBalancer {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        let balancer = NodeBalancer {
            id,
            label: Some(label.to_string()),
            region: "us-east".to_string(),
            hostname: Some(format!("nb-{id}.newark.nodebalancer.linode.com")),
            ipv4: Some(format!("45.79.{}.{}", id / 256 % 256, id % 256)),
            ipv6: None,
            client_conn_throttle: 0,
            tags: vec![],
        };
        state.index.insert_balancer(id);
        state.balancers.insert(id, balancer.clone());
        balancer
    }

    /// Remove a balancer without going through the API log.
    pub fn delete_out_of_band(&self, balancer: BalancerId) {
        let mut state = self.state.lock().unwrap();
        let removed = state.index.remove_balancer(balancer);
        for node in removed.nodes {
            state.nodes.remove(&node);
        }
        for config in removed.configs {
            state.configs.remove(&config);
        }
        state.balancers.remove(&balancer);
    }

    /// Copy the config listening on `port` under a fresh id, as a second
    /// writer racing the controller would. The copy has no nodes.
    pub fn seed_duplicate_config(&self, port: u16) -> ConfigId {
        let mut state = self.state.lock().unwrap();
        let original = state
            .configs
            .values()
            .find(|config| config.port == port)
            .cloned()
            .unwrap();
        let id = state.id();
        state.configs.insert(id, NodeBalancerConfig { id, ..original });
        id
    }

    pub fn reset_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    #[must_use]
    pub fn mutations(&self) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(Request::is_mutation)
            .collect()
    }

    #[must_use]
    pub fn balancers(&self) -> Vec<NodeBalancer> {
        self.state.lock().unwrap().balancers.values().cloned().collect()
    }

    #[must_use]
    pub fn configs(&self) -> Vec<NodeBalancerConfig> {
        self.state.lock().unwrap().configs.values().cloned().collect()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<NodeBalancerNode> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    #[must_use]
    pub fn nodes_for_port(&self, port: u16) -> Vec<NodeBalancerNode> {
        let state = self.state.lock().unwrap();
        let configs = state
            .configs
            .values()
            .filter(|c| c.port == port)
            .map(|c| c.id)
            .collect::<Vec<_>>();
        state
            .nodes
            .values()
            .filter(|n| configs.contains(&n.config_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LinodeApi for FakeLinode {
    async fn list_nodebalancers(&self, filter: &Filter) -> LinodeResult<Vec<NodeBalancer>> {
        let mut state = self.state.lock().unwrap();
        state.record("list_nodebalancers", "GET", "/nodebalancers".to_string())?;
        Ok(state
            .balancers
            .values()
            .filter(|nb| filter.is_empty() || filter.matches_balancer(nb))
            .cloned()
            .collect())
    }

    async fn get_nodebalancer(&self, id: BalancerId) -> LinodeResult<NodeBalancer> {
        let mut state = self.state.lock().unwrap();
        state.record("get_nodebalancer", "GET", format!("/nodebalancers/{id}"))?;
        state.balancers.get(&id).cloned().ok_or_else(LinodeError::not_found)
    }

    async fn create_nodebalancer(
        &self,
        options: &NodeBalancerCreateOptions,
    ) -> LinodeResult<NodeBalancer> {
        let mut state = self.state.lock().unwrap();
        state.record("create_nodebalancer", "POST", "/nodebalancers".to_string())?;
        let id = state.id();
        let balancer = NodeBalancer {
            id,
            label: Some(options.label.clone()),
            region: options.region.clone(),
            hostname: Some(format!("nb-{id}.{}.nodebalancer.linode.com", options.region)),
            ipv4: Some(format!("45.79.{}.{}", id / 256 % 256, id % 256)),
            ipv6: None,
            client_conn_throttle: options.client_conn_throttle,
            tags: options.tags.clone(),
        };
        state.index.insert_balancer(id);
        state.balancers.insert(id, balancer.clone());
        for nested in &options.configs {
            let config_id = state.id();
            state.store_config(id, config_id, &nested.config);
            for node in &nested.nodes {
                state.store_node(id, config_id, node)?;
            }
        }
        Ok(balancer)
    }

    async fn update_nodebalancer(
        &self,
        id: BalancerId,
        options: &NodeBalancerUpdateOptions,
    ) -> LinodeResult<NodeBalancer> {
        let mut state = self.state.lock().unwrap();
        state.record("update_nodebalancer", "PUT", format!("/nodebalancers/{id}"))?;
        let balancer = state.balancers.get_mut(&id).ok_or_else(LinodeError::not_found)?;
        if let Some(label) = &options.label {
            balancer.label = Some(label.clone());
        }
        if let Some(throttle) = options.client_conn_throttle {
            balancer.client_conn_throttle = throttle;
        }
        if let Some(tags) = &options.tags {
            balancer.tags = tags.clone();
        }
        Ok(balancer.clone())
    }

    async fn delete_nodebalancer(&self, id: BalancerId) -> LinodeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record("delete_nodebalancer", "DELETE", format!("/nodebalancers/{id}"))?;
        if state.balancers.remove(&id).is_none() {
            return Err(LinodeError::not_found());
        }
        let removed = state.index.remove_balancer(id);
        for node in removed.nodes {
            state.nodes.remove(&node);
        }
        for config in removed.configs {
            state.configs.remove(&config);
        }
        Ok(())
    }

    async fn list_configs(&self, balancer: BalancerId) -> LinodeResult<Vec<NodeBalancerConfig>> {
        let mut state = self.state.lock().unwrap();
        state.record("list_configs", "GET", format!("/nodebalancers/{balancer}/configs"))?;
        if !state.balancers.contains_key(&balancer) {
            return Err(LinodeError::not_found());
        }
        Ok(state
            .configs
            .values()
            .filter(|c| c.nodebalancer_id == balancer)
            .cloned()
            .collect())
    }

    async fn create_config(
        &self,
        balancer: BalancerId,
        options: &ConfigOptions,
    ) -> LinodeResult<NodeBalancerConfig> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "create_config",
            "POST",
            format!("/nodebalancers/{balancer}/configs"),
        )?;
        if !state.balancers.contains_key(&balancer) {
            return Err(LinodeError::not_found());
        }
        if state
            .configs
            .values()
            .any(|c| c.nodebalancer_id == balancer && c.port == options.port)
        {
            return Err(LinodeError::api(400, "port already in use"));
        }
        let id = state.id();
        Ok(state.store_config(balancer, id, options))
    }

    async fn update_config(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &ConfigOptions,
    ) -> LinodeResult<NodeBalancerConfig> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "update_config",
            "PUT",
            format!("/nodebalancers/{balancer}/configs/{config}"),
        )?;
        state.config_entry(balancer, config)?;
        Ok(state.store_config(balancer, config, options))
    }

    async fn rebuild_config(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &ConfigWithNodes,
    ) -> LinodeResult<NodeBalancerConfig> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "rebuild_config",
            "POST",
            format!("/nodebalancers/{balancer}/configs/{config}/rebuild"),
        )?;
        state.config_entry(balancer, config)?;
        for node in state.index.nodes_of(config) {
            state.index.remove_node(node);
            state.nodes.remove(&node);
        }
        let stored = state.store_config(balancer, config, &options.config);
        for node in &options.nodes {
            state.store_node(balancer, config, node)?;
        }
        Ok(stored)
    }

    async fn delete_config(&self, balancer: BalancerId, config: ConfigId) -> LinodeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "delete_config",
            "DELETE",
            format!("/nodebalancers/{balancer}/configs/{config}"),
        )?;
        state.config_entry(balancer, config)?;
        state.drop_config(config);
        Ok(())
    }

    async fn list_nodes(
        &self,
        balancer: BalancerId,
        config: ConfigId,
    ) -> LinodeResult<Vec<NodeBalancerNode>> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "list_nodes",
            "GET",
            format!("/nodebalancers/{balancer}/configs/{config}/nodes"),
        )?;
        state.config_entry(balancer, config)?;
        Ok(state
            .nodes
            .values()
            .filter(|n| n.config_id == config)
            .cloned()
            .collect())
    }

    async fn create_node(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &NodeCreateOptions,
    ) -> LinodeResult<NodeBalancerNode> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "create_node",
            "POST",
            format!("/nodebalancers/{balancer}/configs/{config}/nodes"),
        )?;
        state.config_entry(balancer, config)?;
        state.store_node(balancer, config, options)
    }

    async fn delete_node(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        node: NodeId,
    ) -> LinodeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(
            "delete_node",
            "DELETE",
            format!("/nodebalancers/{balancer}/configs/{config}/nodes/{node}"),
        )?;
        if !state
            .nodes
            .get(&node)
            .is_some_and(|n| n.config_id == config && n.nodebalancer_id == balancer)
        {
            return Err(LinodeError::not_found());
        }
        state.index.remove_node(node);
        state.nodes.remove(&node);
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> LinodeResult<Instance> {
        let mut state = self.state.lock().unwrap();
        state.record("get_instance", "GET", format!("/linode/instances/{id}"))?;
        state.instances.get(&id).cloned().ok_or_else(LinodeError::not_found)
    }

    async fn list_instances(&self, filter: &Filter) -> LinodeResult<Vec<Instance>> {
        let mut state = self.state.lock().unwrap();
        state.record("list_instances", "GET", "/linode/instances".to_string())?;
        Ok(state
            .instances
            .values()
            .filter(|i| filter.is_empty() || filter.matches_instance(i))
            .cloned()
            .collect())
    }
}
