use serde::{Deserialize, Serialize};

pub type BalancerId = u64;
pub type ConfigId = u64;
pub type NodeId = u64;
pub type InstanceId = u64;

/// Placeholder the API returns instead of stored TLS material.
pub const REDACTED: &str = "<REDACTED>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Roundrobin,
    Leastconn,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stickiness {
    #[default]
    None,
    Table,
    HttpCookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    None,
    #[default]
    Connection,
    Http,
    HttpBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    None,
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherSuite {
    #[default]
    Recommended,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    #[default]
    Accept,
    Reject,
    Drain,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Offline,
    Booting,
    Rebooting,
    ShuttingDown,
    Provisioning,
    Deleting,
    Migrating,
    Rebuilding,
    Cloning,
    Restoring,
    Stopped,
    Resizing,
    #[serde(other)]
    Unknown,
}

/// The provider's managed load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBalancer {
    pub id: BalancerId,
    #[serde(default)]
    pub label: Option<String>,
    pub region: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub client_conn_throttle: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-port listener of a balancer, as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBalancerConfig {
    pub id: ConfigId,
    pub nodebalancer_id: BalancerId,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub stickiness: Stickiness,
    #[serde(default)]
    pub check: CheckType,
    #[serde(default)]
    pub check_interval: i32,
    #[serde(default)]
    pub check_timeout: i32,
    #[serde(default)]
    pub check_attempts: i32,
    #[serde(default)]
    pub check_path: String,
    #[serde(default)]
    pub check_body: String,
    #[serde(default)]
    pub check_passive: bool,
    #[serde(default)]
    pub cipher_suite: CipherSuite,
    #[serde(default)]
    pub ssl_commonname: String,
    #[serde(default)]
    pub ssl_fingerprint: String,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
}

/// Backend target of a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBalancerNode {
    pub id: NodeId,
    pub config_id: ConfigId,
    pub nodebalancer_id: BalancerId,
    pub address: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub mode: NodeMode,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub label: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub ipv4: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCreateOptions {
    pub address: String,
    pub label: String,
    pub weight: i32,
    pub mode: NodeMode,
}

/// Attributes of a config accepted by create and in-place update.
///
/// TLS fields are only serialized when set, so an update without them leaves
/// the stored material untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigOptions {
    pub port: u16,
    pub protocol: Protocol,
    pub proxy_protocol: ProxyProtocol,
    pub algorithm: Algorithm,
    pub stickiness: Stickiness,
    pub check: CheckType,
    pub check_interval: i32,
    pub check_timeout: i32,
    pub check_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_body: Option<String>,
    pub check_passive: bool,
    pub cipher_suite: CipherSuite,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<String>,
}

/// Config plus its full node list. Used for nested creation inside a new
/// balancer and for the atomic rebuild call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigWithNodes {
    #[serde(flatten)]
    pub config: ConfigOptions,
    pub nodes: Vec<NodeCreateOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBalancerCreateOptions {
    pub label: String,
    pub region: String,
    pub client_conn_throttle: i32,
    pub tags: Vec<String>,
    pub configs: Vec<ConfigWithNodes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeBalancerUpdateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_conn_throttle: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl NodeBalancerUpdateOptions {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.label.is_none() && self.client_conn_throttle.is_none() && self.tags.is_none()
    }
}

/// One page of a list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default = "first_page")]
    pub pages: u32,
}

const fn first_page() -> u32 {
    1
}
