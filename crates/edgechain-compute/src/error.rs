//! Compute error types.

use edgechain_core::ImageError;
use edgechain_network::NetworkError;
use thiserror::Error;

/// Errors raised while defining tasks, launching services, or registering
/// them with a balancer. All of them describe input that cannot work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("invalid task definition: {0}")]
    InvalidTask(String),

    #[error("unsupported task size: {cpu} cpu units with {memory_mib} MiB")]
    InvalidSizing { cpu: u32, memory_mib: u32 },

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("tier {0} is public; services run on isolated tiers only")]
    PublicPlacement(String),

    #[error("container not found in task definition: {0}")]
    UnknownContainer(String),

    #[error("container {container} does not map port {port}")]
    UnmappedPort { container: String, port: u16 },

    #[error("service already registered with target group {0}")]
    DuplicateRegistration(String),

    #[error("image: {0}")]
    Image(#[from] ImageError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),
}

pub type ComputeResult<T> = Result<T, ComputeError>;
