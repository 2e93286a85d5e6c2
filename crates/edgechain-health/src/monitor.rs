//! Health monitor: one background loop per target group.
//!
//! Each loop probes its own targets on the group's fixed interval, records
//! transitions in the state store, and publishes the aggregated listener
//! state on a `watch` channel. Loops share nothing but the store, so no
//! global lock is involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use edgechain_balancer::ListenerState;
use edgechain_core::HealthCheckSpec;
use edgechain_state::{StateStore, TargetHealthRecord, TargetHealthState};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::BoxFuture;
use crate::checker::{HealthTracker, ProbeTarget, Prober};

/// Invoked on every target transition with `(target group, target, state)`.
pub type HealthCallback = Arc<dyn Fn(String, String, TargetHealthState) -> BoxFuture<'static, ()> + Send + Sync>;

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ListenerState>,
}

pub struct HealthMonitor {
    env: String,
    state: StateStore,
    prober: Arc<dyn Prober>,
    /// Active monitors: target group id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    on_transition: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(env: &str, state: StateStore, prober: Arc<dyn Prober>) -> Self {
        Self {
            env: env.to_string(),
            state,
            prober,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_transition: None,
        }
    }

    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// Start probing `targets` of `target_group`, replacing any running loop
    /// for the same group. Returns a receiver for the aggregated state.
    pub async fn start_monitor(
        &self,
        target_group: &str,
        spec: &HealthCheckSpec,
        targets: Vec<ProbeTarget>,
    ) -> watch::Receiver<ListenerState> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ListenerState::Listening);

        let ctx = LoopContext {
            env: self.env.clone(),
            target_group: target_group.to_string(),
            spec: spec.clone(),
            targets,
            state: self.state.clone(),
            prober: self.prober.clone(),
            callback: self.on_transition.clone(),
        };
        let handle = tokio::spawn(run_health_loop(ctx, state_tx, shutdown_rx));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            target_group.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
                state_rx: state_rx.clone(),
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(env = %self.env, target_group, interval = ?spec.interval, "health monitor started");
        state_rx
    }

    pub async fn subscribe(&self, target_group: &str) -> Option<watch::Receiver<ListenerState>> {
        let monitors = self.monitors.read().await;
        monitors.get(target_group).map(|slot| slot.state_rx.clone())
    }

    pub async fn stop_monitor(&self, target_group: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(target_group) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(target_group, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(target_group = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }
}

struct LoopContext {
    env: String,
    target_group: String,
    spec: HealthCheckSpec,
    targets: Vec<ProbeTarget>,
    state: StateStore,
    prober: Arc<dyn Prober>,
    callback: Option<HealthCallback>,
}

async fn run_health_loop(
    ctx: LoopContext,
    state_tx: watch::Sender<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut trackers: Vec<HealthTracker> = ctx.targets.iter().map(|_| HealthTracker::new(&ctx.spec)).collect();
    let mut ticker = tokio::time::interval(ctx.spec.interval);
    // The first tick of `interval` fires immediately; probes start one interval in.
    ticker.tick().await;

    debug!(target_group = %ctx.target_group, targets = ctx.targets.len(), "health loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (target, tracker) in ctx.targets.iter().zip(trackers.iter_mut()) {
                    let result = ctx.prober.probe(target).await;
                    let before = tracker.state();
                    let after = tracker.record(result);
                    if before == after {
                        continue;
                    }
                    let record = TargetHealthRecord {
                        env: ctx.env.clone(),
                        target_group: ctx.target_group.clone(),
                        target: target.id.clone(),
                        state: after,
                        reason: (!result.is_success()).then(|| format!("{result:?}")),
                        updated_at: epoch_secs(),
                    };
                    if let Err(e) = ctx.state.put_target_health(&record) {
                        error!(target = %target.id, error = %e, "failed to persist target health");
                    }
                    if let Some(cb) = &ctx.callback {
                        cb(ctx.target_group.clone(), target.id.clone(), after).await;
                    }
                }
                let states: Vec<_> = trackers.iter().map(HealthTracker::state).collect();
                state_tx.send_if_modified(|current| {
                    let next = ListenerState::from_targets(&states);
                    let changed = *current != next;
                    *current = next;
                    changed
                });
            }
            _ = shutdown.changed() => {
                debug!(target_group = %ctx.target_group, "health loop shutting down");
                break;
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
