// Service annotations.
pub const LB_BALANCER_ID_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-nodebalancer-id";
pub const LB_LABEL_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-label";
pub const LB_REGION_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-region";
pub const LB_THROTTLE_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-throttle";
pub const LB_TAGS_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-tags";
/// Written by the controller: last applied TLS digest per https port.
pub const LB_TLS_DIGESTS_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-tls-digests";
pub const LB_NODE_SELECTOR: &str = "service.beta.kubernetes.io/linode-loadbalancer-node-selector";

// Per-config options.
pub const LB_DEFAULT_PROTOCOL_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-default-protocol";
pub const LB_PORT_ANN_PREFIX: &str = "service.beta.kubernetes.io/linode-loadbalancer-port-";
pub const LB_ALGORITHM_ANN_NAME: &str = "service.beta.kubernetes.io/linode-loadbalancer-algorithm";
pub const LB_STICKINESS_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-stickiness";
pub const LB_CHECK_TYPE_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-type";
pub const LB_CHECK_PATH_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-path";
pub const LB_CHECK_BODY_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-body";
pub const LB_CHECK_INTERVAL_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-interval";
pub const LB_CHECK_TIMEOUT_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-timeout";
pub const LB_CHECK_ATTEMPTS_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-attempts";
pub const LB_CHECK_PASSIVE_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-check-passive";
pub const LB_CIPHER_SUITE_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-cipher-suite";
pub const LB_PROXY_PROTOCOL_ANN_NAME: &str =
    "service.beta.kubernetes.io/linode-loadbalancer-proxy-protocol";

pub const DEFAULT_LB_THROTTLE: i32 = 20;
pub const MAX_LB_THROTTLE: i32 = 20;
pub const DEFAULT_CHECK_INTERVAL: i32 = 5;
pub const DEFAULT_CHECK_TIMEOUT: i32 = 3;
pub const DEFAULT_CHECK_ATTEMPTS: i32 = 2;
pub const DEFAULT_CHECK_PATH: &str = "/";
pub const DEFAULT_NODE_WEIGHT: i32 = 100;
/// Linode caps labels at 32 characters.
pub const MAX_LABEL_LEN: usize = 32;
pub const LABEL_PREFIX: &str = "ccm-";

// TLS.
pub const TLS_CERT_MARKER: &str = "BEGIN CERTIFICATE";
pub const TLS_KEY_MARKER: &str = "PRIVATE KEY";
pub const TLS_SECRET_CERT_KEY: &str = "tls.crt";
pub const TLS_SECRET_KEY_KEY: &str = "tls.key";

// Nodes.
pub const PROVIDER_ID_PREFIX: &str = "linode://";
pub const EXCLUDE_FROM_LB_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";

// CSR.
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";
pub const NODE_USER_PREFIX: &str = "system:node:";
pub const CSR_APPROVAL_ATTEMPTS: u32 = 3;
pub const CSR_APPROVAL_DELAY_MS: u64 = 100;

pub const FINALIZER_NAME: &str = "linode-ccm/finalizer";
pub const CONTROLLER_NAME: &str = "linode-cloud-controller-manager";
