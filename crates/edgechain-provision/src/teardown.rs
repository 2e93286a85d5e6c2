//! Environment teardown.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ProvisionResult;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub env: String,
    pub resources: usize,
    pub outputs: u32,
    pub target_health: u32,
}

impl Orchestrator {
    /// Delete every recorded resource, newest first, then forget the
    /// environment's outputs and target health. Safe to repeat: resources
    /// already gone from the platform are only removed from the record.
    pub async fn destroy(&self) -> ProvisionResult<TeardownReport> {
        let env = self.environment();
        let records = env.state.list_resources(&env.name)?;
        info!(env = %env.name, resources = records.len(), "teardown started");

        let resources = self.remove_records(records).await?;
        let outputs = env.state.clear_outputs(&env.name)?;
        let target_health = env.state.clear_target_health(&env.name)?;

        info!(env = %env.name, resources, outputs, target_health, "teardown finished");
        Ok(TeardownReport {
            env: env.name.clone(),
            resources,
            outputs,
            target_health,
        })
    }
}
