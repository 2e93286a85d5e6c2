//! Record types persisted by the state store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of an environment (one provisioned stack).
pub type EnvId = String;

// ── Resources ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Fabric,
    Subnet,
    RouteTable,
    SecurityGroup,
    SecurityGroupRule,
    Endpoint,
    Cluster,
    TaskDefinition,
    Service,
    LoadBalancer,
    TargetGroup,
    Listener,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Fabric => "fabric",
            ResourceKind::Subnet => "subnet",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::SecurityGroupRule => "security_group_rule",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::Cluster => "cluster",
            ResourceKind::TaskDefinition => "task_definition",
            ResourceKind::Service => "service",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::TargetGroup => "target_group",
            ResourceKind::Listener => "listener",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical address of a resource within an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A resource the platform created for an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub env: EnvId,
    pub key: ResourceKey,
    /// Identifier assigned by the platform.
    pub physical_id: String,
    /// Hex sha256 of the desired attributes the resource was created from.
    pub fingerprint: String,
    pub attributes: serde_json::Value,
    /// Creation order within the environment; teardown runs it backwards.
    pub sequence: u64,
    /// Run that created (or last replaced) this resource.
    pub run_id: String,
    pub created_at: u64,
}

impl ResourceRecord {
    pub fn table_key(&self) -> String {
        resource_key(&self.env, &self.key)
    }
}

pub(crate) fn resource_key(env: &str, key: &ResourceKey) -> String {
    format!("{env}/{}/{}", key.kind, key.name)
}

// ── Outputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub env: EnvId,
    pub key: String,
    pub value: String,
}

impl OutputRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.env, self.key)
    }
}

// ── Target health ─────────────────────────────────────────────────

/// Health of one target as seen by the balancer that probes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealthState {
    /// Registered, not enough probes yet to decide.
    Initial,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealthRecord {
    pub env: EnvId,
    pub target_group: String,
    /// `ip:port` for task targets, listener id for balancer targets.
    pub target: String,
    pub state: TargetHealthState,
    pub reason: Option<String>,
    pub updated_at: u64,
}

impl TargetHealthRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.env, self.target_group, self.target)
    }
}
