//! Linode v4 API surface used by the controllers.
//!
//! The [`LinodeApi`] trait is the seam between reconciliation and the
//! network. [`client::LinodeClient`] talks HTTP, the fake in `fake.rs`
//! serves the same contract from memory for tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod models;

use models::{
    BalancerId, ConfigId, ConfigOptions, ConfigWithNodes, Instance, InstanceId, NodeBalancer,
    NodeBalancerConfig, NodeBalancerCreateOptions, NodeBalancerNode, NodeBalancerUpdateOptions,
    NodeCreateOptions, NodeId,
};

use crate::retry::Retryable;

pub type LinodeResult<T> = Result<T, LinodeError>;

#[derive(Debug, Error)]
pub enum LinodeError {
    #[error("Linode API returned {status}: {}", reasons.join("; "))]
    Api { status: u16, reasons: Vec<String> },
    #[error("Linode API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Cannot decode Linode API response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LinodeError {
    #[must_use]
    pub fn api(status: u16, reason: impl Into<String>) -> Self {
        Self::Api {
            status,
            reasons: vec![reason.into()],
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::api(404, "Not found")
    }

    /// Not-found is the signal to create instead of update.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

impl Retryable for LinodeError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.status().is_some_and(|s| s.is_server_error())
            }
            Self::Decode(_) => false,
        }
    }
}

/// Structured `X-Filter` query. The API matches every key exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    fields: Map<String, Value>,
}

impl Filter {
    #[must_use]
    pub fn label(label: impl Into<String>) -> Self {
        Self::default().with("label", Value::String(label.into()))
    }

    #[must_use]
    pub fn ipv4(address: impl Into<String>) -> Self {
        Self::default().with("ipv4", Value::String(address.into()))
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Header value sent with list requests.
    #[must_use]
    pub fn to_header(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    /// Check a balancer against the filter. Unknown keys never match.
    #[must_use]
    pub fn matches_balancer(&self, balancer: &NodeBalancer) -> bool {
        self.fields.iter().all(|(key, value)| {
            let Some(expected) = value.as_str() else {
                return false;
            };
            match key.as_str() {
                "label" => balancer.label.as_deref() == Some(expected),
                "ipv4" => balancer.ipv4.as_deref() == Some(expected),
                _ => false,
            }
        })
    }

    #[must_use]
    pub fn matches_instance(&self, instance: &Instance) -> bool {
        self.fields.iter().all(|(key, value)| {
            let Some(expected) = value.as_str() else {
                return false;
            };
            match key.as_str() {
                "label" => instance.label == expected,
                "region" => instance.region == expected,
                _ => false,
            }
        })
    }
}

/// Remote operations over the balancer → config → node graph and instances.
///
/// Nodes have no update call: attribute changes are delete + create.
#[async_trait]
pub trait LinodeApi: Send + Sync {
    async fn list_nodebalancers(&self, filter: &Filter) -> LinodeResult<Vec<NodeBalancer>>;
    async fn get_nodebalancer(&self, id: BalancerId) -> LinodeResult<NodeBalancer>;
    async fn create_nodebalancer(
        &self,
        options: &NodeBalancerCreateOptions,
    ) -> LinodeResult<NodeBalancer>;
    async fn update_nodebalancer(
        &self,
        id: BalancerId,
        options: &NodeBalancerUpdateOptions,
    ) -> LinodeResult<NodeBalancer>;
    /// Deletes the balancer together with its configs and nodes.
    async fn delete_nodebalancer(&self, id: BalancerId) -> LinodeResult<()>;

    async fn list_configs(&self, balancer: BalancerId) -> LinodeResult<Vec<NodeBalancerConfig>>;
    async fn create_config(
        &self,
        balancer: BalancerId,
        options: &ConfigOptions,
    ) -> LinodeResult<NodeBalancerConfig>;
    async fn update_config(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &ConfigOptions,
    ) -> LinodeResult<NodeBalancerConfig>;
    /// Atomically replaces protocol, TLS material and the node list.
    async fn rebuild_config(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &ConfigWithNodes,
    ) -> LinodeResult<NodeBalancerConfig>;
    async fn delete_config(&self, balancer: BalancerId, config: ConfigId) -> LinodeResult<()>;

    async fn list_nodes(
        &self,
        balancer: BalancerId,
        config: ConfigId,
    ) -> LinodeResult<Vec<NodeBalancerNode>>;
    async fn create_node(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        options: &NodeCreateOptions,
    ) -> LinodeResult<NodeBalancerNode>;
    async fn delete_node(
        &self,
        balancer: BalancerId,
        config: ConfigId,
        node: NodeId,
    ) -> LinodeResult<()>;

    async fn get_instance(&self, id: InstanceId) -> LinodeResult<Instance>;
    async fn list_instances(&self, filter: &Filter) -> LinodeResult<Vec<Instance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(label: &str, ipv4: &str) -> NodeBalancer {
        NodeBalancer {
            id: 1,
            label: Some(label.to_string()),
            region: "us-east".to_string(),
            hostname: None,
            ipv4: Some(ipv4.to_string()),
            ipv6: None,
            client_conn_throttle: 0,
            tags: vec![],
        }
    }

    #[test]
    fn filter_header_is_json_object() {
        assert_eq!(Filter::label("ccm-a").to_header(), r#"{"label":"ccm-a"}"#);
        assert_eq!(Filter::ipv4("1.2.3.4").to_header(), r#"{"ipv4":"1.2.3.4"}"#);
    }

    #[test]
    fn filter_matches_exactly() {
        let nb = balancer("ccm-abc", "45.0.0.1");
        assert!(Filter::label("ccm-abc").matches_balancer(&nb));
        assert!(!Filter::label("ccm-ab").matches_balancer(&nb));
        assert!(!Filter::label("ccm-abcd").matches_balancer(&nb));
        assert!(Filter::ipv4("45.0.0.1").matches_balancer(&nb));
        assert!(!Filter::ipv4("45.0.0.10").matches_balancer(&nb));
        assert!(!Filter::ipv4("45.0.0").matches_balancer(&nb));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(LinodeError::api(503, "unavailable").is_retryable());
        assert!(LinodeError::api(429, "slow down").is_retryable());
        assert!(!LinodeError::api(400, "bad request").is_retryable());
        assert!(!LinodeError::not_found().is_retryable());
        assert!(LinodeError::not_found().is_not_found());
    }
}
