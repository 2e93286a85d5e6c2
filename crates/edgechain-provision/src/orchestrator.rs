//! Orchestrator: walks the steps in dependency order, reconciling each
//! step's desired resources against the observed state before moving on.
//!
//! A step only starts once every resource of the step before it is on
//! record. A failed step stops the run; nothing after it is attempted and
//! nothing before it is rolled back, so the store always reflects what the
//! platform holds.
//!
//! Replacements are created before the resource they supersede is removed.
//! Superseded resources are only deleted once the run has finished (or has
//! failed for good), never while it can still be cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use edgechain_balancer::{BalancerError, CertificateRef, TargetKind};
use edgechain_core::HealthCheckSpec;
use edgechain_health::{HealthMonitor, ProbeTarget, Prober};
use edgechain_network::ReachabilityError;
use edgechain_state::{OutputRecord, ResourceKey, ResourceKind, ResourceRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::blueprint::{Blueprint, Deployment};
use crate::context::Environment;
use crate::error::{ProvisionError, ProvisionResult};
use crate::plan::{Action, Plan, action_for, diff};
use crate::platform::{Platform, PlatformError, PlatformResult};
use crate::resource::{DesiredResource, Step};
use crate::retry::RetryPolicy;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Ready,
    /// Provisioned, but a runtime reachability check failed.
    Degraded,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub env: String,
    pub run_id: String,
    pub plan: Plan,
    pub status: EnvironmentStatus,
    pub outputs: Vec<OutputRecord>,
    pub warnings: Vec<ReachabilityError>,
    pub deployment: Deployment,
}

/// Bounded, retried platform calls. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub(crate) struct Realizer {
    platform: Arc<dyn Platform>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Realizer {
    pub(crate) fn new(env: &Environment) -> Self {
        Self {
            platform: env.platform.clone(),
            retry: env.retry_policy(),
            call_timeout: env.settings.call_timeout,
        }
    }

    /// Create `resource`, or update it in place when its physical id
    /// already exists.
    async fn realize(&self, resource: &DesiredResource) -> ProvisionResult<String> {
        let platform = self.platform.as_ref();
        let timeout = self.call_timeout;
        self.retry
            .run(&format!("create {}", resource.key), |attempt| async move {
                if attempt > 1 && !resource.idempotent {
                    // The failed attempt may have gone through.
                    let describe = platform.describe(&resource.key, &resource.physical_id);
                    if bounded(timeout, &resource.key, describe).await? {
                        return Err(ProvisionError::PartialResource {
                            resource: resource.key.to_string(),
                            physical_id: resource.physical_id.clone(),
                        });
                    }
                }
                bounded(timeout, &resource.key, platform.create(resource)).await
            })
            .await
    }

    /// Delete a resource; one that is already gone counts as deleted.
    pub(crate) async fn remove(&self, key: &ResourceKey, physical_id: &str) -> ProvisionResult<()> {
        let platform = self.platform.as_ref();
        let timeout = self.call_timeout;
        let result = self
            .retry
            .run(&format!("delete {key}"), |_| bounded(timeout, key, platform.delete(key, physical_id)))
            .await;
        match result {
            Err(ProvisionError::Platform(PlatformError::NotFound(_))) => {
                debug!(resource = %key, "already gone");
                Ok(())
            }
            other => other,
        }
    }
}

/// Run one platform call under `timeout`. A call that does not answer in
/// time fails; it is not retried.
async fn bounded<T>(
    timeout: Duration,
    key: &ResourceKey,
    call: impl Future<Output = PlatformResult<T>>,
) -> ProvisionResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(ProvisionError::from),
        Err(_) => Err(ProvisionError::Timeout {
            resource: key.to_string(),
            timeout,
        }),
    }
}

/// Resolves once `cancel` is set. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct Orchestrator {
    env: Environment,
    realizer: Realizer,
}

impl Orchestrator {
    pub fn new(env: Environment) -> Self {
        let realizer = Realizer::new(&env);
        Self { env, realizer }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Build every step without touching the platform.
    pub fn build(&self) -> ProvisionResult<(Vec<DesiredResource>, Deployment)> {
        let observed = self.env.state.list_resources(&self.env.name)?;
        let previous_task = recorded_task(&observed);
        let mut blueprint = Blueprint::new(self.env.config.clone());
        let mut desired = Vec::new();
        for step in Step::ORDER {
            let resources = blueprint
                .stage(step, previous_task, self.env.certificates.as_ref())
                .map_err(|e| e.in_step(step))?;
            desired.extend(resources);
        }
        Ok((desired, blueprint.into_deployment()?))
    }

    /// What `apply` would change, given the state on record.
    pub fn plan(&self) -> ProvisionResult<Plan> {
        let (desired, _) = self.build()?;
        let observed = self.env.state.list_resources(&self.env.name)?;
        let plan = diff(&desired, &observed);
        info!(
            env = %self.env.name,
            create = plan.count(Action::Create),
            replace = plan.count(Action::Replace),
            delete = plan.count(Action::Delete),
            "plan computed"
        );
        Ok(plan)
    }

    /// Reconcile the environment step by step. Setting `cancel` stops the
    /// run, deletes newest first every resource this run created and puts
    /// back every resource it replaced.
    pub async fn apply(&self, cancel: watch::Receiver<bool>) -> ProvisionResult<ApplyReport> {
        let env = &self.env.name;
        let run_id = next_run_id(env);
        let observed = self.env.state.list_resources(env)?;
        let recorded: HashMap<ResourceKey, ResourceRecord> =
            observed.iter().map(|r| (r.key.clone(), r.clone())).collect();
        let previous_task = recorded_task(&observed);
        info!(env = %env, run_id = %run_id, recorded = observed.len(), "apply started");

        let mut blueprint = Blueprint::new(self.env.config.clone());
        let mut desired = Vec::new();

        for step in Step::ORDER {
            let outcome = self
                .run_step(step, &mut blueprint, previous_task, &recorded, &run_id, cancel.clone())
                .await;
            match outcome {
                Ok(resources) => desired.extend(resources),
                Err(ProvisionError::Cancelled) => {
                    warn!(env = %env, step = %step, run_id = %run_id, "apply cancelled, unwinding");
                    self.unwind(&run_id, &recorded, step, &desired).await?;
                    return Err(ProvisionError::Cancelled.in_step(step));
                }
                Err(e) => {
                    let e = e.in_step(step);
                    if let Err(retire) = self.retire_superseded(&run_id, &recorded).await {
                        warn!(env = %env, error = %retire, "superseded resources left in place");
                    }
                    let on_record = self.env.state.list_resources(env)?.len();
                    error!(
                        env = %env,
                        step = %step,
                        kind = %e.kind(),
                        on_record,
                        error = %e,
                        "step failed, later steps not attempted"
                    );
                    return Err(e);
                }
            }
        }

        let plan = diff(&desired, &observed);
        self.retire_superseded(&run_id, &recorded).await?;
        for change in plan.pending().filter(|c| c.action == Action::Delete) {
            self.realizer.remove(&change.key, &change.physical_id).await?;
            self.env.state.delete_resource(env, &change.key)?;
            info!(resource = %change.key, "stale resource deleted");
        }

        let deployment = blueprint.into_deployment()?;
        let outputs = self.save_outputs(&deployment)?;

        let warnings = deployment.verify_reachability();
        for warning in &warnings {
            warn!(env = %env, error = %warning, "environment degraded");
        }
        let status = if warnings.is_empty() {
            EnvironmentStatus::Ready
        } else {
            EnvironmentStatus::Degraded
        };

        info!(
            env = %env,
            run_id = %run_id,
            status = ?status,
            created = plan.count(Action::Create),
            replaced = plan.count(Action::Replace),
            deleted = plan.count(Action::Delete),
            "apply finished"
        );
        Ok(ApplyReport {
            env: env.clone(),
            run_id,
            plan,
            status,
            outputs,
            warnings,
            deployment,
        })
    }

    async fn run_step(
        &self,
        step: Step,
        blueprint: &mut Blueprint,
        previous_task: Option<&ResourceRecord>,
        recorded: &HashMap<ResourceKey, ResourceRecord>,
        run_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> ProvisionResult<Vec<DesiredResource>> {
        if step == Step::InternalBalancer {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(ProvisionError::Cancelled),
                resolved = self.resolve_certificate() => resolved?,
            }
        }
        let resources = blueprint.stage(step, previous_task, self.env.certificates.as_ref())?;
        info!(step = %step, resources = resources.len(), "step started");

        let pending: Vec<&DesiredResource> = resources
            .iter()
            .filter(|r| action_for(r, recorded.get(&r.key)) != Action::NoOp)
            .collect();

        if step == Step::Endpoints {
            // Endpoints only read the finished fabric and policy.
            let mut set = JoinSet::new();
            for resource in pending {
                let realizer = self.realizer.clone();
                let resource = resource.clone();
                set.spawn(async move {
                    let result = realizer.realize(&resource).await;
                    (resource, result)
                });
            }
            // After a cancel, in-flight creates are still awaited so that
            // every endpoint that made it onto the platform is recorded.
            let mut interrupted = false;
            let mut first_error = None;
            loop {
                let joined = if interrupted {
                    set.join_next().await
                } else {
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => {
                            debug!(in_flight = set.len(), "cancel received, draining endpoint creates");
                            interrupted = true;
                            continue;
                        }
                        joined = set.join_next() => joined,
                    }
                };
                let Some(joined) = joined else { break };
                let (resource, result) = joined?;
                match result {
                    Ok(physical_id) => self.record(&resource, physical_id, run_id)?,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if interrupted {
                return Err(ProvisionError::Cancelled);
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        } else {
            for resource in pending {
                let physical_id = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => return Err(ProvisionError::Cancelled),
                    created = self.realizer.realize(resource) => created?,
                };
                self.record(resource, physical_id, run_id)?;
            }
        }

        debug!(step = %step, "step complete");
        Ok(resources)
    }

    /// Check the certificate up front so store hiccups are retried before
    /// anything in the balancer step is created.
    async fn resolve_certificate(&self) -> ProvisionResult<()> {
        let reference = CertificateRef::new(self.env.config.balancer.certificate.clone());
        let store = self.env.certificates.clone();
        self.env
            .retry_policy()
            .run("resolve certificate", |_| {
                let result = store
                    .resolve(&reference)
                    .map(|_| ())
                    .map_err(|e| ProvisionError::from(BalancerError::from(e)));
                async move { result }
            })
            .await
    }

    fn record(&self, resource: &DesiredResource, physical_id: String, run_id: &str) -> ProvisionResult<()> {
        let env = &self.env.name;
        let record = ResourceRecord {
            env: env.clone(),
            key: resource.key.clone(),
            physical_id,
            fingerprint: resource.fingerprint.clone(),
            attributes: resource.attributes.clone(),
            sequence: self.env.state.next_sequence(env)?,
            run_id: run_id.to_string(),
            created_at: epoch_secs(),
        };
        self.env.state.put_resource(&record)?;
        debug!(resource = %record.key, physical_id = %record.physical_id, sequence = record.sequence, "resource recorded");
        Ok(())
    }

    /// Undo, newest first, what `run_id` did. Resources it created are
    /// deleted. Resources it replaced get their earlier record back: a
    /// replacement with a new physical id is deleted, one updated in place
    /// is updated back.
    async fn unwind(
        &self,
        run_id: &str,
        recorded: &HashMap<ResourceKey, ResourceRecord>,
        interrupted: Step,
        finished: &[DesiredResource],
    ) -> ProvisionResult<usize> {
        let env = &self.env.name;
        let steps: HashMap<&ResourceKey, Step> = finished.iter().map(|r| (&r.key, r.step)).collect();
        let mut records: Vec<ResourceRecord> = self
            .env
            .state
            .list_resources(env)?
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect();
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let (mut removed, mut restored) = (0, 0);
        for record in &records {
            match recorded.get(&record.key) {
                Some(earlier) => {
                    if earlier.physical_id == record.physical_id {
                        let step = steps.get(&record.key).copied().unwrap_or(interrupted);
                        self.realizer.realize(&restore(earlier, step)).await?;
                    } else {
                        self.realizer.remove(&record.key, &record.physical_id).await?;
                    }
                    self.env.state.put_resource(earlier)?;
                    debug!(resource = %record.key, physical_id = %earlier.physical_id, "earlier resource restored");
                    restored += 1;
                }
                None => {
                    self.realizer.remove(&record.key, &record.physical_id).await?;
                    self.env.state.delete_resource(env, &record.key)?;
                    debug!(resource = %record.key, "resource removed");
                    removed += 1;
                }
            }
        }
        info!(env = %env, run_id, removed, restored, "run unwound");
        Ok(removed + restored)
    }

    /// Delete the physical resources `run_id` replaced under a new id. Their
    /// keys already point at the replacements.
    async fn retire_superseded(&self, run_id: &str, recorded: &HashMap<ResourceKey, ResourceRecord>) -> ProvisionResult<usize> {
        let current = self.env.state.list_resources(&self.env.name)?;
        let mut superseded: Vec<&ResourceRecord> = current
            .iter()
            .filter(|r| r.run_id == run_id)
            .filter_map(|r| recorded.get(&r.key).filter(|earlier| earlier.physical_id != r.physical_id))
            .collect();
        superseded.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        for earlier in &superseded {
            self.realizer.remove(&earlier.key, &earlier.physical_id).await?;
            info!(resource = %earlier.key, physical_id = %earlier.physical_id, "superseded resource deleted");
        }
        Ok(superseded.len())
    }

    /// Delete `records` from the platform and the store in reverse creation
    /// order.
    pub(crate) async fn remove_records(&self, mut records: Vec<ResourceRecord>) -> ProvisionResult<usize> {
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        for record in &records {
            self.realizer.remove(&record.key, &record.physical_id).await?;
            self.env.state.delete_resource(&self.env.name, &record.key)?;
            debug!(resource = %record.key, "resource removed");
        }
        Ok(records.len())
    }

    fn save_outputs(&self, deployment: &Deployment) -> ProvisionResult<Vec<OutputRecord>> {
        let env = &self.env.name;
        self.env.state.clear_outputs(env)?;
        let mut outputs = Vec::new();
        for (key, value) in deployment.outputs() {
            let record = OutputRecord {
                env: env.clone(),
                key,
                value,
            };
            self.env.state.put_output(&record)?;
            info!(env = %env, key = %record.key, value = %record.value, "output");
            outputs.push(record);
        }
        Ok(outputs)
    }

    pub fn outputs(&self) -> ProvisionResult<Vec<OutputRecord>> {
        Ok(self.env.state.list_outputs(&self.env.name)?)
    }

    /// Start one health loop per target group of the deployed chain.
    /// Task targets are probed on their health-check port, balancer targets
    /// through the listener they point at.
    pub async fn monitor(&self, deployment: &Deployment, prober: Arc<dyn Prober>) -> HealthMonitor {
        let monitor = HealthMonitor::new(&self.env.name, self.env.state.clone(), prober);
        for (target_group, spec, targets) in probe_targets(deployment) {
            monitor.start_monitor(&target_group, &spec, targets).await;
        }
        monitor
    }
}

/// `(target group id, health check, targets)` for every enabled group.
pub fn probe_targets(deployment: &Deployment) -> Vec<(String, HealthCheckSpec, Vec<ProbeTarget>)> {
    deployment
        .internal
        .target_groups()
        .iter()
        .chain(deployment.external.target_groups())
        .filter(|tg| tg.health_check.enabled)
        .map(|tg| {
            let targets = tg
                .targets
                .iter()
                .filter_map(|t| {
                    let host = match (&tg.kind, &t.listener) {
                        (TargetKind::Listener, Some(handle)) => handle.dns_name.clone(),
                        (TargetKind::Listener, None) => return None,
                        _ => t.id.rsplit_once(':').map_or(t.id.clone(), |(host, _)| host.to_string()),
                    };
                    let address = format!("{host}:{}", tg.probe_port(t));
                    Some(ProbeTarget::new(&t.id, &address, &tg.health_check))
                })
                .collect();
            (tg.id.clone(), tg.health_check.clone(), targets)
        })
        .collect()
}

/// The desired form of `earlier`, for updating a replaced resource back.
fn restore(earlier: &ResourceRecord, step: Step) -> DesiredResource {
    DesiredResource {
        key: earlier.key.clone(),
        step,
        physical_id: earlier.physical_id.clone(),
        attributes: earlier.attributes.clone(),
        fingerprint: earlier.fingerprint.clone(),
        idempotent: true,
    }
}

fn recorded_task(observed: &[ResourceRecord]) -> Option<&ResourceRecord> {
    observed.iter().find(|r| r.key.kind == ResourceKind::TaskDefinition)
}

fn next_run_id(env: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{env}-{millis}-{}", NEXT_RUN.fetch_add(1, Ordering::Relaxed))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
