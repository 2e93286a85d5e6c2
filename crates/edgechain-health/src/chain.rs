//! Tick-driven evaluation of health across the balancer chain.
//!
//! One [`HealthChain::tick`] is one probe interval: every internal target is
//! probed (task answers), then every external target is probed by sending a
//! request through the internal balancer. Running the tiers in that order
//! means an internal change is visible to the external probe of the same
//! tick.

use std::collections::HashMap;

use edgechain_balancer::{ApplicationBalancer, ListenerState, NetworkBalancer, Target};
use edgechain_core::HealthCheckSpec;
use edgechain_state::TargetHealthState;
use http::Request;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checker::{HealthTracker, ProbeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub tick: u64,
    /// Internal TLS listener.
    pub internal: ListenerState,
    /// External TCP listener.
    pub external: ListenerState,
    /// `(target group, target, state)` for every target in the chain.
    pub targets: Vec<(String, String, TargetHealthState)>,
}

impl ChainSnapshot {
    pub fn target(&self, target: &str) -> Option<TargetHealthState> {
        self.targets.iter().find(|(_, t, _)| t == target).map(|(_, _, s)| *s)
    }
}

pub struct HealthChain {
    internal: ApplicationBalancer,
    external: NetworkBalancer,
    internal_port: u16,
    external_port: u16,
    /// Keyed by `(target group, target)`; each group only touches its own.
    trackers: HashMap<(String, String), HealthTracker>,
    tick: u64,
}

impl HealthChain {
    pub fn new(
        internal: ApplicationBalancer,
        external: NetworkBalancer,
        internal_port: u16,
        external_port: u16,
    ) -> Self {
        let mut trackers = HashMap::new();
        for tg in internal.target_groups().iter().chain(external.target_groups()) {
            for target in &tg.targets {
                trackers.insert((tg.id.clone(), target.id.clone()), HealthTracker::new(&tg.health_check));
            }
        }
        Self {
            internal,
            external,
            internal_port,
            external_port,
            trackers,
            tick: 0,
        }
    }

    /// Advance one probe interval. `task_probe` answers for each task target.
    pub fn tick<F>(&mut self, mut task_probe: F) -> ChainSnapshot
    where
        F: FnMut(&Target) -> ProbeResult,
    {
        self.tick += 1;

        let internal_updates: Vec<_> = self
            .internal
            .target_groups()
            .iter()
            .filter(|tg| tg.health_check.enabled)
            .flat_map(|tg| tg.targets.iter().map(move |t| (tg.id.clone(), tg.health_check.clone(), t.clone())))
            .collect();
        for (tg, spec, target) in internal_updates {
            let result = task_probe(&target);
            let state = self.record(&tg, &target.id, &spec, result);
            if let Err(e) = self.internal.set_target_health(&tg, &target.id, state, reason(result)) {
                warn!(target_group = %tg, target_id = %target.id, error = %e, "internal target health not applied");
            }
        }

        let external_updates: Vec<_> = self
            .external
            .target_groups()
            .iter()
            .filter(|tg| tg.health_check.enabled)
            .flat_map(|tg| tg.targets.iter().map(move |t| (tg.id.clone(), tg.health_check.clone(), t.clone())))
            .collect();
        for (tg, spec, target) in external_updates {
            let result = self.probe_internal(&target, &spec.path);
            let state = self.record(&tg, &target.id, &spec, result);
            if let Err(e) = self.external.set_target_health(&tg, &target.id, state, reason(result)) {
                warn!(target_group = %tg, target_id = %target.id, error = %e, "external target health not applied");
            }
        }

        let snapshot = self.snapshot();
        debug!(
            tick = snapshot.tick,
            internal = ?snapshot.internal,
            external = ?snapshot.external,
            "health chain evaluated"
        );
        snapshot
    }

    fn record(&mut self, tg: &str, target: &str, spec: &HealthCheckSpec, result: ProbeResult) -> TargetHealthState {
        let tracker = self
            .trackers
            .entry((tg.to_string(), target.to_string()))
            .or_insert_with(|| HealthTracker::new(spec));
        let before = tracker.state();
        let after = tracker.record(result);
        if before != after {
            info!(target_group = tg, target, from = ?before, to = ?after, "target health changed");
        }
        after
    }

    /// HTTPS probe against the internal listener. The balancer answers 200
    /// only while it has a healthy target to forward to.
    fn probe_internal(&self, target: &Target, path: &str) -> ProbeResult {
        let Some(handle) = &target.listener else {
            return ProbeResult::Failed;
        };
        let uri = format!("https://{}{path}", handle.dns_name);
        let Ok(request) = Request::get(uri).body(()) else {
            return ProbeResult::Failed;
        };
        match self.internal.handle(handle.port, &request) {
            Ok(response) if response.status().is_success() => ProbeResult::Healthy,
            Ok(_) => ProbeResult::Unhealthy,
            Err(_) => ProbeResult::Failed,
        }
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let targets = self
            .internal
            .target_groups()
            .iter()
            .chain(self.external.target_groups())
            .flat_map(|tg| tg.targets.iter().map(|t| (tg.id.clone(), t.id.clone(), t.health)))
            .collect();
        ChainSnapshot {
            tick: self.tick,
            internal: self
                .internal
                .listener(self.internal_port)
                .map_or(ListenerState::Created, |l| l.state),
            external: self
                .external
                .listener(self.external_port)
                .map_or(ListenerState::Created, |l| l.state),
            targets,
        }
    }

    pub fn internal(&self) -> &ApplicationBalancer {
        &self.internal
    }

    pub fn external(&self) -> &NetworkBalancer {
        &self.external
    }

    pub fn into_parts(self) -> (ApplicationBalancer, NetworkBalancer) {
        (self.internal, self.external)
    }
}

fn reason(result: ProbeResult) -> Option<String> {
    match result {
        ProbeResult::Healthy => None,
        ProbeResult::Unhealthy => Some("non-2xx response".to_string()),
        ProbeResult::Failed => Some("connection failed or timed out".to_string()),
    }
}
