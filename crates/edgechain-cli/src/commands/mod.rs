pub mod health;
pub mod provision;
pub mod stack;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use edgechain_core::StackConfig;
use edgechain_provision::{Environment, Orchestrator, SimulatedPlatform};
use edgechain_state::StateStore;

/// Global options shared by every command.
pub struct Context {
    pub config: PathBuf,
    pub state_dir: PathBuf,
    pub env: String,
    pub json: bool,
}

impl Context {
    pub fn load_config(&self) -> anyhow::Result<StackConfig> {
        StackConfig::from_file(&self.config).with_context(|| format!("reading {}", self.config.display()))
    }

    pub fn open_state(&self) -> anyhow::Result<StateStore> {
        std::fs::create_dir_all(&self.state_dir)?;
        let path = self.state_dir.join("state.redb");
        StateStore::open(&path).with_context(|| format!("opening state at {}", path.display()))
    }

    /// Orchestrator for the selected environment on a simulated platform.
    pub fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        let config = self.load_config()?;
        let state = self.open_state()?;
        let env = Environment::new(&self.env, config, state, Arc::new(SimulatedPlatform::new()))?;
        Ok(Orchestrator::new(env))
    }

    /// Print `value` as JSON, or `text` otherwise.
    pub fn emit(&self, value: &serde_json::Value, text: &str) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{text}");
        }
        Ok(())
    }
}
