//! Platform interface: the control-plane calls provisioning is built on.
//!
//! The orchestrator only ever creates, describes, and deletes resources by
//! key. [`SimulatedPlatform`] implements the interface in memory and can
//! inject throttling, slow calls, rejections, and partial creations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgechain_health::BoxFuture;
use edgechain_state::{ResourceKey, ResourceKind};
use thiserror::Error;
use tracing::debug;

use crate::resource::DesiredResource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("throttled: {0}")]
    Throttled(String),

    /// A dependency created moments ago is not visible yet.
    #[error("not yet consistent: {0}")]
    NotConsistent(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Throttled(_) | PlatformError::NotConsistent(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

pub trait Platform: Send + Sync {
    /// Create a resource; returns the physical id the platform assigned.
    fn create<'a>(&'a self, resource: &'a DesiredResource) -> BoxFuture<'a, PlatformResult<String>>;

    /// Whether `physical_id` exists as the resource at `key`.
    fn describe<'a>(&'a self, key: &'a ResourceKey, physical_id: &'a str) -> BoxFuture<'a, PlatformResult<bool>>;

    fn delete<'a>(&'a self, key: &'a ResourceKey, physical_id: &'a str) -> BoxFuture<'a, PlatformResult<()>>;
}

/// Control-plane operation, as seen in the simulated call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Describe,
    Delete,
}

/// Scripted misbehaviour for one resource kind.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the next `times` creates with this error.
    Fail { times: u32, error: PlatformError },
    /// Delay every create.
    Delay(Duration),
    /// Record the resource, then fail the create with this error.
    Partial(PlatformError),
}

#[derive(Debug, Default)]
struct SimState {
    /// Physical id → logical key.
    resources: HashMap<String, ResourceKey>,
    faults: HashMap<ResourceKind, Fault>,
    key_faults: HashMap<ResourceKey, Fault>,
    calls: Vec<(Operation, ResourceKey)>,
}

/// In-memory platform. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlatform {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, kind: ResourceKind, fault: Fault) {
        let mut state = self.inner.lock().expect("platform lock poisoned");
        state.faults.insert(kind, fault);
    }

    /// Like [`inject`](Self::inject), for a single resource. Takes
    /// precedence over a fault on its kind.
    pub fn inject_for(&self, key: ResourceKey, fault: Fault) {
        let mut state = self.inner.lock().expect("platform lock poisoned");
        state.key_faults.insert(key, fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.inner.lock().expect("platform lock poisoned");
        state.faults.clear();
        state.key_faults.clear();
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        let state = self.inner.lock().expect("platform lock poisoned");
        state.resources.values().any(|k| k == key)
    }

    pub fn resource_count(&self) -> usize {
        let state = self.inner.lock().expect("platform lock poisoned");
        state.resources.len()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        let state = self.inner.lock().expect("platform lock poisoned");
        state.resources.values().filter(|k| k.kind == kind).count()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(Operation, ResourceKey)> {
        let state = self.inner.lock().expect("platform lock poisoned");
        state.calls.clone()
    }

    pub fn calls_for(&self, kind: ResourceKind, op: Operation) -> usize {
        let state = self.inner.lock().expect("platform lock poisoned");
        state.calls.iter().filter(|(o, k)| *o == op && k.kind == kind).count()
    }

    /// Apply the fault for `key`, or failing that its kind. Returns the
    /// delay to wait and the error to fail with.
    fn take_fault(state: &mut SimState, key: &ResourceKey) -> (Option<Duration>, Option<(PlatformError, bool)>) {
        let fault = match state.key_faults.get_mut(key) {
            Some(fault) => fault,
            None => match state.faults.get_mut(&key.kind) {
                Some(fault) => fault,
                None => return (None, None),
            },
        };
        let (delay, failure, spent) = match fault {
            Fault::Delay(d) => (Some(*d), None, false),
            Fault::Fail { times, error } if *times > 0 => {
                *times -= 1;
                (None, Some((error.clone(), false)), false)
            }
            Fault::Fail { .. } => (None, None, false),
            Fault::Partial(error) => (None, Some((error.clone(), true)), true),
        };
        if spent && state.key_faults.remove(key).is_none() {
            state.faults.remove(&key.kind);
        }
        (delay, failure)
    }
}

impl Platform for SimulatedPlatform {
    fn create<'a>(&'a self, resource: &'a DesiredResource) -> BoxFuture<'a, PlatformResult<String>> {
        Box::pin(async move {
            let (delay, failure) = {
                let mut state = self.inner.lock().expect("platform lock poisoned");
                state.calls.push((Operation::Create, resource.key.clone()));
                Self::take_fault(&mut state, &resource.key)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.inner.lock().expect("platform lock poisoned");
            if let Some(owner) = state.resources.get(&resource.physical_id)
                && owner != &resource.key
            {
                return Err(PlatformError::Rejected(format!(
                    "{} is already in use by {owner}",
                    resource.physical_id
                )));
            }
            match failure {
                Some((error, partial)) => {
                    if partial {
                        state
                            .resources
                            .insert(resource.physical_id.clone(), resource.key.clone());
                    }
                    debug!(resource = %resource.key, %error, partial, "simulated create failed");
                    Err(error)
                }
                None => {
                    state
                        .resources
                        .insert(resource.physical_id.clone(), resource.key.clone());
                    Ok(resource.physical_id.clone())
                }
            }
        })
    }

    fn describe<'a>(&'a self, key: &'a ResourceKey, physical_id: &'a str) -> BoxFuture<'a, PlatformResult<bool>> {
        Box::pin(async move {
            let mut state = self.inner.lock().expect("platform lock poisoned");
            state.calls.push((Operation::Describe, key.clone()));
            Ok(state.resources.get(physical_id) == Some(key))
        })
    }

    fn delete<'a>(&'a self, key: &'a ResourceKey, physical_id: &'a str) -> BoxFuture<'a, PlatformResult<()>> {
        Box::pin(async move {
            let mut state = self.inner.lock().expect("platform lock poisoned");
            state.calls.push((Operation::Delete, key.clone()));
            match state.resources.get(physical_id) {
                Some(owner) if owner == key => {
                    state.resources.remove(physical_id);
                    Ok(())
                }
                Some(owner) => Err(PlatformError::Rejected(format!(
                    "{physical_id} belongs to {owner}, not {key}"
                ))),
                None => Err(PlatformError::NotFound(format!("{key} ({physical_id})"))),
            }
        })
    }
}
