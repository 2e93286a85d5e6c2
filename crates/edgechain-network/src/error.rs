//! Network error types.

use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors raised while building the fabric, policy, or endpoints.
///
/// All of these are configuration problems: the input describes a topology
/// that cannot be built. Runtime reachability failures are reported
/// separately as [`crate::ReachabilityError`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("unknown subnet tier: {0}")]
    UnknownTier(String),

    #[error("address space exhausted: {0}")]
    AddressSpace(String),

    #[error("security group already declared: {0}")]
    DuplicateGroup(String),

    #[error("unknown security group: {0}")]
    UnknownGroup(String),

    #[error("security group handle does not belong to this policy")]
    ForeignHandle,

    #[error("least-privilege violation: {0}")]
    LeastPrivilege(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl NetworkError {
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        Self::Endpoint(msg.into())
    }
}
