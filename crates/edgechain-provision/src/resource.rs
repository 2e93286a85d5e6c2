//! Desired resources and the steps that produce them.

use std::fmt;

use edgechain_state::{ResourceKey, ResourceKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProvisionResult;

/// Provisioning steps in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Fabric,
    Policy,
    Endpoints,
    Compute,
    InternalBalancer,
    ExternalBalancer,
}

impl Step {
    pub const ORDER: [Step; 6] = [
        Step::Fabric,
        Step::Policy,
        Step::Endpoints,
        Step::Compute,
        Step::InternalBalancer,
        Step::ExternalBalancer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Fabric => "fabric",
            Step::Policy => "policy",
            Step::Endpoints => "endpoints",
            Step::Compute => "compute",
            Step::InternalBalancer => "internal_balancer",
            Step::ExternalBalancer => "external_balancer",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource the environment should have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub step: Step,
    /// Identifier the platform should assign.
    pub physical_id: String,
    pub attributes: serde_json::Value,
    pub fingerprint: String,
    /// Safe to repeat after a failed attempt without checking for leftovers.
    pub idempotent: bool,
}

impl DesiredResource {
    pub fn new(
        step: Step,
        kind: ResourceKind,
        name: impl Into<String>,
        physical_id: impl Into<String>,
        attributes: impl Serialize,
    ) -> ProvisionResult<Self> {
        let attributes = serde_json::to_value(attributes)?;
        Ok(Self {
            key: ResourceKey::new(kind, name),
            step,
            physical_id: physical_id.into(),
            fingerprint: fingerprint(&attributes),
            attributes,
            idempotent: true,
        })
    }

    /// Mark as a call that must not be blindly repeated (certificate binding).
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

/// Hex sha256 of the canonical JSON encoding. `serde_json` maps keep
/// their keys sorted, so equal values always hash equally.
pub fn fingerprint(attributes: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(attributes.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
