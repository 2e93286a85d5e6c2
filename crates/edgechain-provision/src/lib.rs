//! edgechain-provision: turns a stack config into a running environment.
//!
//! The [`Blueprint`] builds the domain objects of each step (fabric, policy,
//! endpoints, compute, internal and external balancer) and lists the
//! resources that realize them. The [`Orchestrator`] diffs those against the
//! environment's observed state and drives the [`Platform`] through the
//! difference, one step at a time:
//!
//! ```text
//! fabric ─▶ policy ─▶ endpoints (concurrent) ─▶ compute ─▶ internal balancer ─▶ external balancer
//! ```
//!
//! Every platform call is bounded by the configured timeout. Throttling and
//! eventual-consistency errors are retried with exponential backoff; all
//! other failures stop the run at the failing step.

pub mod blueprint;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod platform;
pub mod resource;
pub mod retry;
pub mod teardown;

pub use blueprint::{Blueprint, Deployment, Groups};
pub use context::Environment;
pub use error::{ErrorKind, ProvisionError, ProvisionResult};
pub use orchestrator::{ApplyReport, EnvironmentStatus, Orchestrator, probe_targets};
pub use plan::{Action, Change, Plan, diff};
pub use platform::{Fault, Operation, Platform, PlatformError, PlatformResult, SimulatedPlatform};
pub use resource::{DesiredResource, Step, fingerprint};
pub use retry::RetryPolicy;
pub use teardown::TeardownReport;
