use thiserror::Error;

use crate::{linode::LinodeError, retry::RetryError};

pub type CCMResult<T> = Result<T, CCMError>;

#[derive(Debug, Error)]
pub enum CCMError {
    #[error("Cannot parse node filter: {0}")]
    InvalidNodeFilter(String),
    #[error("Service was skipped")]
    SkipService,
    #[error("Invalid value {value:?} for annotation {annotation}: {reason}")]
    InvalidAnnotation {
        annotation: String,
        value: String,
        reason: String,
    },
    #[error("Invalid TLS material for port {port}: {reason}")]
    InvalidTls { port: u16, reason: String },
    #[error("Invalid load balancer configuration: {0}")]
    Validation(String),
    #[error("Cannot parse provider id {0:?}")]
    InvalidProviderId(String),
    #[error("Instance {0} has no IP addresses")]
    InstanceNoAddresses(u64),
    #[error("Instance for node {0} was not found")]
    InstanceNotFound(String),
    #[error("Cannot parse integer value: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("Cannot parse boolean value: {0}")]
    ParseBoolError(#[from] std::str::ParseBoolError),
    #[error("Cannot serialize value: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Linode error: {0}")]
    LinodeError(#[from] LinodeError),
    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),
}

impl CCMError {
    /// Locally detected contract violations. These are never retried and
    /// never reach the remote API.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidNodeFilter(_)
                | Self::InvalidAnnotation { .. }
                | Self::InvalidTls { .. }
                | Self::Validation(_)
                | Self::ParseIntError(_)
                | Self::ParseBoolError(_)
        )
    }

    pub fn invalid_annotation(
        annotation: &str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidAnnotation {
            annotation: annotation.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<RetryError<LinodeError>> for CCMError {
    fn from(value: RetryError<LinodeError>) -> Self {
        Self::LinodeError(value.into_inner())
    }
}

impl From<RetryError<kube::Error>> for CCMError {
    fn from(value: RetryError<kube::Error>) -> Self {
        Self::KubeError(value.into_inner())
    }
}
