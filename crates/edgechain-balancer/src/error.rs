//! Balancer error types.

use edgechain_compute::ComputeError;
use edgechain_network::NetworkError;
use thiserror::Error;

use crate::certificate::CertificateError;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("invalid balancer configuration: {0}")]
    Configuration(String),

    #[error("listener already bound to port {0}")]
    DuplicateListener(u16),

    #[error("no listener on port {0}")]
    UnknownListener(u16),

    #[error("target group not found: {0}")]
    UnknownTargetGroup(String),

    #[error("port mismatch at {tier}: expected {expected}, found {found}")]
    PortMismatch {
        tier: String,
        expected: u16,
        found: u16,
    },

    #[error("certificate: {0}")]
    Certificate(#[from] CertificateError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("compute: {0}")]
    Compute(#[from] ComputeError),
}

impl BalancerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type BalancerResult<T> = Result<T, BalancerError>;
