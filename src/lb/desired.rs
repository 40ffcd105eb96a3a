use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::Ipv4Addr,
    str::FromStr,
};

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    config::OperatorConfig,
    consts,
    error::{CCMError, CCMResult},
    label_filter::LabelFilter,
    linode::models::{
        Algorithm, BalancerId, CheckType, CipherSuite, ConfigOptions, ConfigWithNodes, NodeMode,
        Protocol, ProxyProtocol, Stickiness,
    },
};

use super::nodes::DesiredNode;

/// Certificate and key for an https port. Write-only on the remote side.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("digest", &self.digest())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    #[must_use]
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    pub fn validate(&self, port: u16) -> CCMResult<()> {
        if !self.cert.contains(consts::TLS_CERT_MARKER) {
            return Err(CCMError::InvalidTls {
                port,
                reason: "certificate does not contain a PEM certificate block".to_string(),
            });
        }
        if !self.key.contains(consts::TLS_KEY_MARKER) {
            return Err(CCMError::InvalidTls {
                port,
                reason: "key does not contain a PEM private key block".to_string(),
            });
        }
        Ok(())
    }

    /// Stable fingerprint of the material, used to detect changes without
    /// ever reading TLS back from the API.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cert.as_bytes());
        hasher.update([0]);
        hasher.update(self.key.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A backend cluster node and the private address traffic is sent to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Backend {
    pub name: String,
    pub address: Ipv4Addr,
}

/// One declared listener of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPort {
    pub port: u16,
    pub node_port: u16,
    /// Config attributes without TLS material.
    pub options: ConfigOptions,
    pub tls: Option<TlsMaterial>,
    pub nodes: Vec<DesiredNode>,
}

impl DesiredPort {
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.options.protocol
    }

    pub fn validate(&self) -> CCMResult<()> {
        if self.options.protocol != Protocol::Https {
            return Ok(());
        }
        match &self.tls {
            Some(tls) => tls.validate(self.port),
            None => Err(CCMError::InvalidTls {
                port: self.port,
                reason: "https port without TLS material".to_string(),
            }),
        }
    }

    #[must_use]
    pub fn tls_digest(&self) -> Option<String> {
        if self.options.protocol != Protocol::Https {
            return None;
        }
        self.tls.as_ref().map(TlsMaterial::digest)
    }

    /// Options for create calls, TLS included for https.
    #[must_use]
    pub fn create_options(&self) -> ConfigOptions {
        let mut options = self.options.clone();
        if options.protocol == Protocol::Https {
            if let Some(tls) = &self.tls {
                options.ssl_cert = Some(tls.cert.clone());
                options.ssl_key = Some(tls.key.clone());
            }
        }
        options
    }

    /// Options for in-place updates. TLS is left out so the stored
    /// material is not touched.
    #[must_use]
    pub fn update_options(&self) -> ConfigOptions {
        self.options.clone()
    }

    /// Full config with its node list for nested create and rebuild calls.
    #[must_use]
    pub fn with_nodes(&self) -> ConfigWithNodes {
        ConfigWithNodes {
            config: self.create_options(),
            nodes: self.nodes.iter().map(DesiredNode::create_options).collect(),
        }
    }
}

/// Everything the engine needs to converge one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredService {
    pub namespace: String,
    pub name: String,
    /// Identity persisted on the service by an earlier reconcile.
    pub balancer_id: Option<BalancerId>,
    pub label: String,
    pub region: String,
    pub throttle: i32,
    pub tags: Vec<String>,
    pub ports: Vec<DesiredPort>,
    /// TLS digests per port recorded on the service by an earlier reconcile.
    pub applied_tls: BTreeMap<u16, String>,
    /// First ingress IP reported in the service status.
    pub ingress_ip: Option<String>,
}

impl DesiredService {
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn validate(&self) -> CCMResult<()> {
        self.ports.iter().try_for_each(DesiredPort::validate)
    }

    /// Build the desired state from a service, the selected backends and
    /// the TLS material of the secrets its port annotations reference.
    pub fn build(
        svc: &Service,
        config: &OperatorConfig,
        backends: &[Backend],
        tls: &BTreeMap<String, TlsMaterial>,
    ) -> CCMResult<Self> {
        let annotations = svc.annotations();
        let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
        let name = svc.name_any();

        let balancer_id = annotations
            .get(consts::LB_BALANCER_ID_ANN_NAME)
            .map(|value| {
                value.trim().parse::<BalancerId>().map_err(|e| {
                    CCMError::invalid_annotation(consts::LB_BALANCER_ID_ANN_NAME, value, e.to_string())
                })
            })
            .transpose()?;

        let label = match annotations.get(consts::LB_LABEL_ANN_NAME) {
            Some(label) => validate_label(label)?,
            None => default_label(&namespace, &name),
        };

        let region = annotations
            .get(consts::LB_REGION_ANN_NAME)
            .cloned()
            .unwrap_or_else(|| config.default_region.clone());

        let throttle = annotation::<i32>(annotations, consts::LB_THROTTLE_ANN_NAME)?
            .unwrap_or(config.default_lb_throttle);
        if !(0..=consts::MAX_LB_THROTTLE).contains(&throttle) {
            return Err(CCMError::invalid_annotation(
                consts::LB_THROTTLE_ANN_NAME,
                &throttle.to_string(),
                format!("must be between 0 and {}", consts::MAX_LB_THROTTLE),
            ));
        }

        let tags = config
            .default_tags
            .iter()
            .map(String::as_str)
            .chain(
                annotations
                    .get(consts::LB_TAGS_ANN_NAME)
                    .map(|tags| tags.split(','))
                    .into_iter()
                    .flatten(),
            )
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let shared = SharedOptions::from_annotations(annotations, config)?;

        let mut ports = Vec::<DesiredPort>::new();
        for port in svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
        {
            let k8s_protocol = port.protocol.as_deref().unwrap_or("TCP");
            if k8s_protocol != "TCP" {
                tracing::warn!("Protocol {} is not supported. Skipping...", k8s_protocol);
                continue;
            }
            let Some(node_port) = port.node_port else {
                tracing::warn!(
                    "Node port is not set for port {}. Skipping...",
                    port.port
                );
                continue;
            };
            let listen_port = to_port(port.port)?;
            let node_port = to_port(node_port)?;
            if ports.iter().any(|p| p.port == listen_port) {
                tracing::warn!("Port {} is declared twice. Skipping...", listen_port);
                continue;
            }

            let port_ann = PortAnnotation::for_port(annotations, listen_port)?;
            let protocol = match &port_ann.protocol {
                Some(protocol) => protocol.parse().map_err(|e: CCMError| {
                    CCMError::invalid_annotation(
                        &format!("{}{listen_port}", consts::LB_PORT_ANN_PREFIX),
                        protocol,
                        e.to_string(),
                    )
                })?,
                None => shared.protocol,
            };

            let tls = if protocol == Protocol::Https {
                let secret = port_ann.tls_secret_name.as_ref().ok_or_else(|| {
                    CCMError::InvalidTls {
                        port: listen_port,
                        reason: "https port without tls-secret-name".to_string(),
                    }
                })?;
                let material = tls.get(secret).cloned().ok_or_else(|| CCMError::InvalidTls {
                    port: listen_port,
                    reason: format!("TLS secret {secret} was not found"),
                })?;
                material.validate(listen_port)?;
                Some(material)
            } else {
                None
            };

            let options = shared.config_options(listen_port, protocol)?;
            let nodes = backends
                .iter()
                .map(|backend| DesiredNode {
                    address: format!("{}:{node_port}", backend.address),
                    label: truncate_label(&backend.name),
                    weight: consts::DEFAULT_NODE_WEIGHT,
                    mode: NodeMode::Accept,
                })
                .collect();

            ports.push(DesiredPort {
                port: listen_port,
                node_port,
                options,
                tls,
                nodes,
            });
        }

        Ok(Self {
            namespace,
            name,
            balancer_id,
            label,
            region,
            throttle,
            tags,
            ports,
            applied_tls: applied_tls(svc),
            ingress_ip: ingress_ip(svc),
        })
    }
}

/// Digests written by the controller itself. A malformed value only costs a
/// rebuild, so it is dropped with a warning.
fn applied_tls(svc: &Service) -> BTreeMap<u16, String> {
    let Some(raw) = svc.annotations().get(consts::LB_TLS_DIGESTS_ANN_NAME) else {
        return BTreeMap::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Ignoring malformed TLS digest annotation");
        BTreeMap::new()
    })
}

fn ingress_ip(svc: &Service) -> Option<String> {
    svc.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone())
}

/// Per-port annotation value:
/// `{"protocol": "https", "tls-secret-name": "my-cert"}`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PortAnnotation {
    pub protocol: Option<String>,
    pub tls_secret_name: Option<String>,
}

impl PortAnnotation {
    pub fn for_port(annotations: &BTreeMap<String, String>, port: u16) -> CCMResult<Self> {
        let name = format!("{}{port}", consts::LB_PORT_ANN_PREFIX);
        let Some(raw) = annotations.get(&name) else {
            return Ok(Self::default());
        };
        serde_json::from_str(raw)
            .map_err(|e| CCMError::invalid_annotation(&name, raw, e.to_string()))
    }
}

/// Names of the TLS secrets referenced by the service's port annotations.
pub fn tls_secret_names(svc: &Service) -> CCMResult<BTreeSet<String>> {
    let annotations = svc.annotations();
    let mut names = BTreeSet::new();
    for (key, raw) in annotations {
        let Some(port) = key.strip_prefix(consts::LB_PORT_ANN_PREFIX) else {
            continue;
        };
        let port = port
            .parse::<u16>()
            .map_err(|e| CCMError::invalid_annotation(key, raw, e.to_string()))?;
        if let Some(secret) = PortAnnotation::for_port(annotations, port)?.tls_secret_name {
            names.insert(secret);
        }
    }
    Ok(names)
}

/// Config attributes shared by every port of the service.
#[derive(Debug, Clone)]
struct SharedOptions {
    protocol: Protocol,
    algorithm: Algorithm,
    stickiness: Option<Stickiness>,
    check: CheckType,
    check_path: Option<String>,
    check_body: Option<String>,
    check_interval: i32,
    check_timeout: i32,
    check_attempts: i32,
    check_passive: bool,
    cipher_suite: CipherSuite,
    proxy_protocol: ProxyProtocol,
}

impl SharedOptions {
    fn from_annotations(
        annotations: &BTreeMap<String, String>,
        config: &OperatorConfig,
    ) -> CCMResult<Self> {
        Ok(Self {
            protocol: annotation(annotations, consts::LB_DEFAULT_PROTOCOL_ANN_NAME)?
                .unwrap_or(config.default_lb_protocol),
            algorithm: annotation(annotations, consts::LB_ALGORITHM_ANN_NAME)?
                .unwrap_or(config.default_lb_algorithm),
            stickiness: annotation(annotations, consts::LB_STICKINESS_ANN_NAME)?,
            check: annotation(annotations, consts::LB_CHECK_TYPE_ANN_NAME)?
                .unwrap_or(config.default_lb_check_type),
            check_path: annotations.get(consts::LB_CHECK_PATH_ANN_NAME).cloned(),
            check_body: annotations.get(consts::LB_CHECK_BODY_ANN_NAME).cloned(),
            check_interval: annotation(annotations, consts::LB_CHECK_INTERVAL_ANN_NAME)?
                .unwrap_or(config.default_lb_check_interval),
            check_timeout: annotation(annotations, consts::LB_CHECK_TIMEOUT_ANN_NAME)?
                .unwrap_or(config.default_lb_check_timeout),
            check_attempts: annotation(annotations, consts::LB_CHECK_ATTEMPTS_ANN_NAME)?
                .unwrap_or(config.default_lb_check_attempts),
            check_passive: annotation(annotations, consts::LB_CHECK_PASSIVE_ANN_NAME)?
                .unwrap_or(true),
            cipher_suite: annotation(annotations, consts::LB_CIPHER_SUITE_ANN_NAME)?
                .unwrap_or_default(),
            proxy_protocol: annotation(annotations, consts::LB_PROXY_PROTOCOL_ANN_NAME)?
                .unwrap_or_default(),
        })
    }

    fn config_options(&self, port: u16, protocol: Protocol) -> CCMResult<ConfigOptions> {
        let stickiness = self.stickiness.unwrap_or(match protocol {
            Protocol::Tcp => Stickiness::None,
            Protocol::Http | Protocol::Https => Stickiness::Table,
        });
        if protocol == Protocol::Tcp && stickiness == Stickiness::HttpCookie {
            return Err(CCMError::Validation(format!(
                "port {port}: http_cookie stickiness requires an http or https port"
            )));
        }
        let (check_path, check_body) = match self.check {
            CheckType::Http => (
                Some(
                    self.check_path
                        .clone()
                        .unwrap_or_else(|| consts::DEFAULT_CHECK_PATH.to_string()),
                ),
                None,
            ),
            CheckType::HttpBody => {
                let body = self.check_body.clone().ok_or_else(|| {
                    CCMError::Validation(format!(
                        "port {port}: http_body health check requires {}",
                        consts::LB_CHECK_BODY_ANN_NAME
                    ))
                })?;
                (
                    Some(
                        self.check_path
                            .clone()
                            .unwrap_or_else(|| consts::DEFAULT_CHECK_PATH.to_string()),
                    ),
                    Some(body),
                )
            }
            CheckType::None | CheckType::Connection => (None, None),
        };
        Ok(ConfigOptions {
            port,
            protocol,
            proxy_protocol: self.proxy_protocol,
            algorithm: self.algorithm,
            stickiness,
            check: self.check,
            check_interval: self.check_interval,
            check_timeout: self.check_timeout,
            check_attempts: self.check_attempts,
            check_path,
            check_body,
            check_passive: self.check_passive,
            cipher_suite: self.cipher_suite,
            ssl_cert: None,
            ssl_key: None,
        })
    }
}

/// Parse an optional annotation. A present but malformed value is an error.
fn annotation<T>(annotations: &BTreeMap<String, String>, name: &str) -> CCMResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    annotations
        .get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CCMError::invalid_annotation(name, raw, e.to_string()))
        })
        .transpose()
}

fn to_port(value: i32) -> CCMResult<u16> {
    u16::try_from(value)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| CCMError::Validation(format!("port {value} is out of range")))
}

/// Deterministic balancer label for a service.
#[must_use]
pub fn default_label(namespace: &str, name: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(format!("{namespace}/{name}").as_bytes()));
    let len = consts::MAX_LABEL_LEN - consts::LABEL_PREFIX.len();
    format!("{}{}", consts::LABEL_PREFIX, &hash[..len])
}

fn validate_label(label: &str) -> CCMResult<String> {
    let valid_chars = label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !(3..=consts::MAX_LABEL_LEN).contains(&label.len()) || !valid_chars {
        return Err(CCMError::invalid_annotation(
            consts::LB_LABEL_ANN_NAME,
            label,
            "labels are 3-32 characters of letters, digits, '-' and '_'",
        ));
    }
    Ok(label.to_string())
}

fn truncate_label(name: &str) -> String {
    name.chars().take(consts::MAX_LABEL_LEN).collect()
}

/// Pick the backend nodes for a service.
///
/// Ready nodes that are not excluded from external balancers and that
/// match the optional filter, each with its first private `InternalIP`.
#[must_use]
pub fn select_backends(nodes: &[Node], filter: Option<&LabelFilter>) -> Vec<Backend> {
    let mut backends = nodes
        .iter()
        .filter(|node| !node.labels().contains_key(consts::EXCLUDE_FROM_LB_LABEL))
        .filter(|node| filter.map_or(true, |f| f.check(node.labels())))
        .filter(|node| is_ready(node))
        .filter_map(|node| {
            let address = node
                .status
                .as_ref()
                .and_then(|status| status.addresses.as_ref())
                .into_iter()
                .flatten()
                .filter(|addr| addr.type_ == "InternalIP")
                .filter_map(|addr| addr.address.parse::<Ipv4Addr>().ok())
                .find(Ipv4Addr::is_private);
            if address.is_none() {
                tracing::warn!(
                    "Node {} has no private InternalIP. Skipping...",
                    node.name_any()
                );
            }
            address.map(|address| Backend {
                name: node.name_any(),
                address,
            })
        })
        .collect::<Vec<_>>();
    backends.sort();
    backends
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|cond| cond.type_ == "Ready" && cond.status == "True")
}

/// Optional backend filter from the node selector annotation.
pub fn node_filter(svc: &Service) -> CCMResult<Option<LabelFilter>> {
    svc.annotations()
        .get(consts::LB_NODE_SELECTOR)
        .map(|selector| selector.parse())
        .transpose()
}

macro_rules! from_str_enum {
    ($type:ty, $what:literal, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $type {
            type Err = CCMError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    _ => Err(CCMError::Validation(format!(concat!("unknown ", $what, " {:?}"), s))),
                }
            }
        }
    };
}

from_str_enum!(Protocol, "protocol", {
    "tcp" => Protocol::Tcp,
    "http" => Protocol::Http,
    "https" => Protocol::Https,
});

from_str_enum!(Algorithm, "algorithm", {
    "roundrobin" => Algorithm::Roundrobin,
    "leastconn" => Algorithm::Leastconn,
    "source" => Algorithm::Source,
});

from_str_enum!(Stickiness, "stickiness", {
    "none" => Stickiness::None,
    "table" => Stickiness::Table,
    "http_cookie" => Stickiness::HttpCookie,
});

from_str_enum!(CheckType, "check type", {
    "none" => CheckType::None,
    "connection" => CheckType::Connection,
    "http" => CheckType::Http,
    "http_body" => CheckType::HttpBody,
});

from_str_enum!(CipherSuite, "cipher suite", {
    "recommended" => CipherSuite::Recommended,
    "legacy" => CipherSuite::Legacy,
});

from_str_enum!(ProxyProtocol, "proxy protocol", {
    "none" => ProxyProtocol::None,
    "v1" => ProxyProtocol::V1,
    "v2" => ProxyProtocol::V2,
});
