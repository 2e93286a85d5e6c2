//! Provisioning error types and their classification.

use std::fmt;
use std::time::Duration;

use edgechain_balancer::{BalancerError, CertificateError};
use edgechain_compute::ComputeError;
use edgechain_core::ConfigError;
use edgechain_network::{NetworkError, ReachabilityError};
use edgechain_state::StateError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::PlatformError;
use crate::resource::Step;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// How a failure is handled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed topology or input. Fatal, never retried.
    Configuration,
    /// An external reference (certificate) is missing or inaccessible.
    /// Fatal for the step; dependents are not attempted.
    DependencyUnavailable,
    /// Throttling or eventual consistency. Retried with backoff up to the
    /// attempt bound, fatal after that.
    Transient,
    /// Runtime reachability or health failure. Reported as a degraded-state
    /// warning, never as a provisioning failure.
    Reachability,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DependencyUnavailable => "dependency unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Reachability => "reachability",
            ErrorKind::Internal => "internal",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("compute: {0}")]
    Compute(#[from] ComputeError),

    #[error("balancer: {0}")]
    Balancer(#[from] BalancerError),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("platform: {0}")]
    Platform(#[from] PlatformError),

    #[error("{resource}: no response within {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    #[error("{operation}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<ProvisionError>,
    },

    #[error("{resource}: a failed call left {physical_id} behind; not retrying")]
    PartialResource { resource: String, physical_id: String },

    #[error("reachability: {0}")]
    Reachability(#[from] ReachabilityError),

    #[error("run cancelled")]
    Cancelled,

    #[error("step {0} needs the steps before it")]
    OutOfOrder(Step),

    #[error("step {step} failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<ProvisionError>,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to encode resource attributes: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Attach the step a failure happened in. Already-attributed errors
    /// keep their original step.
    pub fn in_step(self, step: Step) -> Self {
        match self {
            ProvisionError::Step { .. } => self,
            other => ProvisionError::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            ProvisionError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Config(_) | ProvisionError::Network(_) | ProvisionError::Compute(_) => {
                ErrorKind::Configuration
            }
            ProvisionError::Balancer(BalancerError::Certificate(e)) => certificate_kind(e),
            ProvisionError::Balancer(_) => ErrorKind::Configuration,
            ProvisionError::Platform(e) if e.is_transient() => ErrorKind::Transient,
            ProvisionError::Platform(PlatformError::Rejected(_)) => ErrorKind::Configuration,
            ProvisionError::Platform(_) => ErrorKind::Internal,
            ProvisionError::Timeout { .. } | ProvisionError::RetriesExhausted { .. } => ErrorKind::Transient,
            ProvisionError::Reachability(_) => ErrorKind::Reachability,
            ProvisionError::Step { source, .. } => source.kind(),
            ProvisionError::State(_)
            | ProvisionError::PartialResource { .. }
            | ProvisionError::Cancelled
            | ProvisionError::OutOfOrder(_)
            | ProvisionError::Join(_)
            | ProvisionError::Encode(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt of the same call may succeed. Timeouts are
    /// excluded: a call that timed out may still complete on the platform.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisionError::Platform(e) => e.is_transient(),
            ProvisionError::Balancer(BalancerError::Certificate(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// The external reference a `DependencyUnavailable` failure is about.
    pub fn reference(&self) -> Option<&str> {
        match self {
            ProvisionError::Balancer(BalancerError::Certificate(e)) => e.reference(),
            ProvisionError::Step { source, .. } => source.reference(),
            _ => None,
        }
    }
}

fn certificate_kind(e: &CertificateError) -> ErrorKind {
    if e.is_transient() {
        ErrorKind::Transient
    } else {
        ErrorKind::DependencyUnavailable
    }
}
