//! Environment context threaded through every provisioning call.

use std::sync::Arc;

use edgechain_balancer::{ArnCertificateStore, CertificateStore};
use edgechain_core::StackConfig;
use edgechain_core::config::ProvisioningSettings;
use edgechain_state::StateStore;

use crate::error::ProvisionResult;
use crate::platform::Platform;
use crate::retry::RetryPolicy;

/// One named environment: its configuration, where its observed state
/// lives, and the collaborators it provisions through. Environments share
/// nothing implicitly, so several can be driven from one process.
#[derive(Clone)]
pub struct Environment {
    pub name: String,
    pub config: StackConfig,
    pub settings: ProvisioningSettings,
    pub state: StateStore,
    pub platform: Arc<dyn Platform>,
    pub certificates: Arc<dyn CertificateStore>,
}

impl Environment {
    /// Validate `config` and bind it to its collaborators. Certificates are
    /// checked for shape and region by default.
    pub fn new(
        name: &str,
        config: StackConfig,
        state: StateStore,
        platform: Arc<dyn Platform>,
    ) -> ProvisionResult<Self> {
        config.validate()?;
        let settings = config.provisioning.settings()?;
        let certificates = Arc::new(ArnCertificateStore::new(&config.stack.region));
        Ok(Self {
            name: name.to_string(),
            config,
            settings,
            state,
            platform,
            certificates,
        })
    }

    pub fn with_certificates(mut self, certificates: Arc<dyn CertificateStore>) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("stack", &self.config.stack.name)
            .field("region", &self.config.stack.region)
            .finish_non_exhaustive()
    }
}
