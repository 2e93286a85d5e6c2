//! edgechain-health: target health for the balancer chain.
//!
//! Every balancer target group runs its own probe loop and only mutates its
//! own targets' health. Health propagates along the chain because each tier
//! probes *through* the tier below it:
//!
//! ```text
//! external target (internal HTTPS listener) ── healthy iff ──▶ internal listener serves
//! internal target (task ip:3000)            ── healthy iff ──▶ task answers 2xx on `/`
//! ```
//!
//! # Components
//!
//! - **`checker`**: `HealthTracker` (consecutive-probe thresholds) and the probes
//! - **`chain`**: deterministic, tick-driven evaluation of the whole chain
//! - **`monitor`**: background loop per target group, persisting transitions
//!
//! A target starts `Initial`, becomes `Healthy` only after `healthy_threshold`
//! consecutive successes and `Unhealthy` only after `unhealthy_threshold`
//! consecutive failures. A single result in the other direction resets the
//! opposite counter, which keeps transient errors from flapping a target.

pub mod chain;
pub mod checker;
pub mod monitor;

pub use chain::{ChainSnapshot, HealthChain};
pub use checker::{
    HealthTracker, NetworkProber, ProbeResult, ProbeTarget, Prober, http_probe, https_probe, probe_tls_config, tcp_probe,
};
pub use monitor::{HealthCallback, HealthMonitor};

/// Boxed future returned by probes and callbacks.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
