use std::collections::{HashMap, HashSet};

use crate::{
    error::CCMResult,
    linode::models::{ConfigId, NodeBalancerConfig, Protocol},
};

use super::desired::DesiredPort;

/// Per-port decisions for one balancer.
#[derive(Debug, Default)]
pub struct ConfigPlan<'a> {
    pub create: Vec<&'a DesiredPort>,
    /// Attribute changes that can be applied in place.
    pub update: Vec<(ConfigId, &'a DesiredPort)>,
    /// Protocol or TLS changes. Applied through the atomic rebuild call.
    pub rebuild: Vec<(ConfigId, &'a DesiredPort)>,
    pub keep: Vec<(ConfigId, &'a DesiredPort)>,
    pub delete: Vec<ConfigId>,
}

impl ConfigPlan<'_> {
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.create.len() + self.update.len() + self.rebuild.len() + self.delete.len()
    }
}

/// Compare desired ports against the configs the API reports.
///
/// `applied_tls` holds the digest of the TLS material last written to each
/// config. The API never returns the material itself, so an https config
/// without a known digest is rebuilt. Validation runs before any decision,
/// an invalid port fails the whole plan.
pub fn diff<'a>(
    desired: &'a [DesiredPort],
    observed: &[NodeBalancerConfig],
    applied_tls: &HashMap<ConfigId, String>,
) -> CCMResult<ConfigPlan<'a>> {
    desired.iter().try_for_each(DesiredPort::validate)?;

    let mut observed = observed.iter().collect::<Vec<_>>();
    observed.sort_by_key(|config| config.id);

    let mut plan = ConfigPlan::default();
    let mut by_port = HashMap::new();
    for config in observed {
        if by_port.contains_key(&config.port) {
            plan.delete.push(config.id);
        } else {
            by_port.insert(config.port, config);
        }
    }

    let mut wanted = HashSet::new();
    for port in desired {
        wanted.insert(port.port);
        let Some(config) = by_port.get(&port.port) else {
            plan.create.push(port);
            continue;
        };
        if needs_rebuild(port, config, applied_tls.get(&config.id)) {
            plan.rebuild.push((config.id, port));
        } else if attributes_differ(port, config) {
            plan.update.push((config.id, port));
        } else {
            plan.keep.push((config.id, port));
        }
    }

    let mut stale = by_port
        .values()
        .filter(|config| !wanted.contains(&config.port))
        .map(|config| config.id)
        .collect::<Vec<_>>();
    stale.sort_unstable();
    plan.delete.extend(stale);
    Ok(plan)
}

fn needs_rebuild(port: &DesiredPort, config: &NodeBalancerConfig, applied: Option<&String>) -> bool {
    if config.protocol != port.protocol() {
        return true;
    }
    port.protocol() == Protocol::Https && applied != port.tls_digest().as_ref()
}

fn attributes_differ(port: &DesiredPort, config: &NodeBalancerConfig) -> bool {
    let options = &port.options;
    let optional_differs = |want: &Option<String>, have: &str| {
        want.as_deref().is_some_and(|want| want != have)
    };
    options.proxy_protocol != config.proxy_protocol
        || options.algorithm != config.algorithm
        || options.stickiness != config.stickiness
        || options.check != config.check
        || options.check_interval != config.check_interval
        || options.check_timeout != config.check_timeout
        || options.check_attempts != config.check_attempts
        || options.check_passive != config.check_passive
        || optional_differs(&options.check_path, &config.check_path)
        || optional_differs(&options.check_body, &config.check_body)
        || (options.protocol == Protocol::Https && options.cipher_suite != config.cipher_suite)
}

#[cfg(test)]
mod tests {
    use crate::linode::models::{
        Algorithm, CheckType, CipherSuite, ConfigOptions, ProxyProtocol, Stickiness, REDACTED,
    };

    use super::{
        super::desired::{
            tests::{CERT, KEY},
            TlsMaterial,
        },
        *,
    };

    fn port(port: u16, protocol: Protocol) -> DesiredPort {
        let tls = (protocol == Protocol::Https).then(|| TlsMaterial::new(CERT, KEY));
        DesiredPort {
            port,
            node_port: 30000 + port,
            options: ConfigOptions {
                port,
                protocol,
                algorithm: Algorithm::Roundrobin,
                stickiness: Stickiness::None,
                check: CheckType::Connection,
                check_interval: 5,
                check_timeout: 3,
                check_attempts: 2,
                check_passive: true,
                ..Default::default()
            },
            tls,
            nodes: vec![],
        }
    }

    fn observed(id: ConfigId, desired: &DesiredPort) -> NodeBalancerConfig {
        let options = &desired.options;
        NodeBalancerConfig {
            id,
            nodebalancer_id: 1,
            port: desired.port,
            protocol: options.protocol,
            proxy_protocol: ProxyProtocol::None,
            algorithm: options.algorithm,
            stickiness: options.stickiness,
            check: options.check,
            check_interval: options.check_interval,
            check_timeout: options.check_timeout,
            check_attempts: options.check_attempts,
            check_path: String::new(),
            check_body: String::new(),
            check_passive: options.check_passive,
            cipher_suite: CipherSuite::Recommended,
            ssl_commonname: String::new(),
            ssl_fingerprint: String::new(),
            ssl_cert: desired.tls.as_ref().map(|_| REDACTED.to_string()),
            ssl_key: desired.tls.as_ref().map(|_| REDACTED.to_string()),
        }
    }

    #[test]
    fn unchanged_configs_are_kept() {
        let desired = vec![port(80, Protocol::Tcp), port(443, Protocol::Https)];
        let observed = vec![observed(10, &desired[0]), observed(11, &desired[1])];
        let digests = HashMap::from([(11, desired[1].tls_digest().unwrap())]);

        let plan = diff(&desired, &observed, &digests).unwrap();
        assert_eq!(plan.mutations(), 0);
        assert_eq!(plan.keep.len(), 2);
    }

    #[test]
    fn creates_missing_and_deletes_stale_ports() {
        let desired = vec![port(80, Protocol::Tcp)];
        let observed = vec![observed(10, &port(8080, Protocol::Tcp))];

        let plan = diff(&desired, &observed, &HashMap::new()).unwrap();
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].port, 80);
        assert_eq!(plan.delete, vec![10]);
    }

    #[test]
    fn attribute_change_is_an_update() {
        let mut desired = vec![port(80, Protocol::Tcp)];
        let observed = vec![observed(10, &desired[0])];
        desired[0].options.algorithm = Algorithm::Leastconn;

        let plan = diff(&desired, &observed, &HashMap::new()).unwrap();
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].0, 10);
        assert!(plan.rebuild.is_empty());
    }

    #[test]
    fn protocol_change_is_a_rebuild() {
        let desired = vec![port(80, Protocol::Http)];
        let observed = vec![observed(10, &port(80, Protocol::Tcp))];

        let plan = diff(&desired, &observed, &HashMap::new()).unwrap();
        assert_eq!(plan.rebuild.len(), 1);
        assert!(plan.update.is_empty());
    }

    #[test]
    fn tls_change_is_a_rebuild() {
        let mut desired = vec![port(443, Protocol::Https)];
        let observed = vec![observed(11, &desired[0])];
        let digests = HashMap::from([(11, desired[0].tls_digest().unwrap())]);
        desired[0].tls = Some(TlsMaterial::new(format!("{CERT}# renewed\n"), KEY));

        let plan = diff(&desired, &observed, &digests).unwrap();
        assert_eq!(plan.rebuild.len(), 1);
    }

    #[test]
    fn unknown_tls_digest_is_a_rebuild() {
        let desired = vec![port(443, Protocol::Https)];
        let observed = vec![observed(11, &desired[0])];

        let plan = diff(&desired, &observed, &HashMap::new()).unwrap();
        assert_eq!(plan.rebuild.len(), 1);
    }

    #[test]
    fn duplicate_port_configs_keep_the_oldest() {
        let desired = vec![port(80, Protocol::Tcp)];
        let observed = vec![observed(12, &desired[0]), observed(10, &desired[0])];

        let plan = diff(&desired, &observed, &HashMap::new()).unwrap();
        assert_eq!(plan.keep.len(), 1);
        assert_eq!(plan.keep[0].0, 10);
        assert_eq!(plan.delete, vec![12]);
    }

    #[test]
    fn invalid_tls_fails_before_any_decision() {
        let mut desired = vec![port(80, Protocol::Tcp), port(443, Protocol::Https)];
        desired[1].tls = Some(TlsMaterial::new("garbage", KEY));

        let err = diff(&desired, &[], &HashMap::new()).unwrap_err();
        assert!(err.is_validation());
    }
}
