use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::{
    consts,
    linode::models::{Algorithm, CheckType, Protocol},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, Parser)]
pub struct OperatorConfig {
    /// Linode API token.
    #[arg(short = 't', long, env = "LINODE_API_TOKEN")]
    pub linode_token: String,

    /// Base URL of the Linode API.
    #[arg(long, env = "LINODE_URL", default_value = "https://api.linode.com/v4")]
    pub linode_url: String,

    /// Region for new NodeBalancers unless the service sets one.
    /// https://www.linode.com/docs/products/platform/get-started/guides/choose-a-data-center/
    #[arg(long, env = "LINODE_REGION")]
    pub default_region: String,

    /// Protocol of ports without an explicit protocol annotation.
    #[arg(long, env = "LINODE_DEFAULT_LB_PROTOCOL", default_value = "tcp", value_parser = parse_protocol)]
    pub default_lb_protocol: Protocol,

    /// Default balancing algorithm.
    /// Possible values:
    /// * `roundrobin`
    /// * `leastconn`
    /// * `source`
    #[arg(long, env = "LINODE_DEFAULT_LB_ALGORITHM", default_value = "roundrobin", value_parser = parse_algorithm)]
    pub default_lb_algorithm: Algorithm,

    /// Default health check type.
    #[arg(long, env = "LINODE_DEFAULT_LB_CHECK_TYPE", default_value = "connection", value_parser = parse_check_type)]
    pub default_lb_check_type: CheckType,

    /// Default health check interval in seconds.
    #[arg(long, env = "LINODE_DEFAULT_LB_CHECK_INTERVAL", default_value = "5")]
    pub default_lb_check_interval: i32,

    /// Default health check timeout in seconds.
    #[arg(long, env = "LINODE_DEFAULT_LB_CHECK_TIMEOUT", default_value = "3")]
    pub default_lb_check_timeout: i32,

    /// Default number of failed checks before a backend is taken out.
    #[arg(long, env = "LINODE_DEFAULT_LB_CHECK_ATTEMPTS", default_value = "2")]
    pub default_lb_check_attempts: i32,

    /// Default client connection throttle (0 disables it).
    #[arg(long, env = "LINODE_DEFAULT_LB_THROTTLE", default_value = "20")]
    pub default_lb_throttle: i32,

    /// Tags put on every NodeBalancer the controller creates.
    #[arg(long, env = "LINODE_DEFAULT_LB_TAGS", value_delimiter = ',')]
    pub default_tags: Vec<String>,

    /// Attempts per Linode API call before the reconcile gives up.
    #[arg(long, env = "LINODE_API_RETRIES", default_value = "3")]
    pub api_retries: u32,

    /// Base delay between retries in milliseconds. Doubles on every attempt.
    #[arg(long, env = "LINODE_API_RETRY_DELAY_MS", default_value = "200")]
    pub api_retry_delay_ms: u64,

    /// Upper bound for a single retry delay in milliseconds.
    #[arg(long, env = "LINODE_API_RETRY_MAX_DELAY_MS", default_value = "10000")]
    pub api_retry_max_delay_ms: u64,

    /// Seconds between periodic reconciles of a service or node.
    #[arg(long, env = "LINODE_REQUEUE_SECONDS", default_value = "30")]
    pub requeue_seconds: u64,

    /// Run the node metadata controller.
    #[arg(long, env = "LINODE_NODE_CONTROLLER", default_value = "true", action = ArgAction::Set)]
    pub node_controller: bool,

    /// Auto-approve kubelet serving certificate requests.
    #[arg(long, env = "LINODE_CSR_APPROVER", default_value = "true", action = ArgAction::Set)]
    pub csr_approver: bool,

    // Log level of the operator.
    #[arg(long, env = "LINODE_CCM_LOG_LEVEL", default_value = "INFO")]
    pub log_level: LevelFilter,
}

impl OperatorConfig {
    #[must_use]
    pub const fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    #[must_use]
    pub const fn api_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.api_retries,
            Duration::from_millis(self.api_retry_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.api_retry_max_delay_ms))
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            linode_token: String::new(),
            linode_url: "https://api.linode.com/v4".to_string(),
            default_region: "us-east".to_string(),
            default_lb_protocol: Protocol::Tcp,
            default_lb_algorithm: Algorithm::Roundrobin,
            default_lb_check_type: CheckType::Connection,
            default_lb_check_interval: consts::DEFAULT_CHECK_INTERVAL,
            default_lb_check_timeout: consts::DEFAULT_CHECK_TIMEOUT,
            default_lb_check_attempts: consts::DEFAULT_CHECK_ATTEMPTS,
            default_lb_throttle: consts::DEFAULT_LB_THROTTLE,
            default_tags: Vec::new(),
            api_retries: 3,
            api_retry_delay_ms: 200,
            api_retry_max_delay_ms: 10_000,
            requeue_seconds: 30,
            node_controller: true,
            csr_approver: true,
            log_level: LevelFilter::INFO,
        }
    }
}

fn parse_protocol(value: &str) -> Result<Protocol, String> {
    value.parse().map_err(|e: crate::error::CCMError| e.to_string())
}

fn parse_algorithm(value: &str) -> Result<Algorithm, String> {
    value.parse().map_err(|e: crate::error::CCMError| e.to_string())
}

fn parse_check_type(value: &str) -> Result<CheckType, String> {
    value.parse().map_err(|e: crate::error::CCMError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_with_defaults() {
        let config = OperatorConfig::try_parse_from([
            "linode-ccm",
            "--linode-token",
            "abc",
            "--default-region",
            "eu-west",
            "--default-tags",
            "kubernetes,prod",
            "--default-lb-algorithm",
            "leastconn",
        ])
        .unwrap();
        assert_eq!(config.default_region, "eu-west");
        assert_eq!(config.default_tags, vec!["kubernetes", "prod"]);
        assert_eq!(config.default_lb_algorithm, Algorithm::Leastconn);
        assert_eq!(config.default_lb_protocol, Protocol::Tcp);
        assert_eq!(config.api_retries, 3);
        assert_eq!(config.requeue_interval(), Duration::from_secs(30));
    }

    #[test]
    fn controllers_can_be_switched_off() {
        let config = OperatorConfig::try_parse_from([
            "linode-ccm",
            "--linode-token",
            "abc",
            "--default-region",
            "eu-west",
            "--node-controller",
            "false",
            "--csr-approver=false",
            "--api-retry-max-delay-ms",
            "500",
        ])
        .unwrap();
        assert!(!config.node_controller);
        assert!(!config.csr_approver);
        assert_eq!(
            config.api_retry_policy().delay_for(10),
            Duration::from_millis(500)
        );

        let defaults = OperatorConfig::try_parse_from([
            "linode-ccm",
            "--linode-token",
            "abc",
            "--default-region",
            "eu-west",
        ])
        .unwrap();
        assert!(defaults.node_controller);
        assert!(defaults.csr_approver);
    }

    #[test]
    fn rejects_unknown_protocol() {
        let result = OperatorConfig::try_parse_from([
            "linode-ccm",
            "--linode-token",
            "abc",
            "--default-region",
            "eu-west",
            "--default-lb-protocol",
            "udp",
        ]);
        assert!(result.is_err());
    }
}
