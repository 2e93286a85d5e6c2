//! edgechain-compute: the container platform side of an environment.
//!
//! A [`Cluster`] lives in a fabric; a [`Service`] keeps a number of copies of
//! one immutable [`TaskDefinition`] running in an isolated tier, with no
//! public address. Services are wired to balancers through
//! [`TargetRegistration`]s, which carry the container port explicitly.
//!
//! # Architecture
//!
//! ```text
//! Cluster
//!   └── Service (desired count, tier, security group)
//!       ├── TaskDefinition (family:revision, containers, sizing)
//!       ├── Tasks (one address per copy, placed round-robin across zones)
//!       └── TargetRegistrations (container name + port → target group)
//! ```

pub mod cluster;
pub mod error;
pub mod rotation;
pub mod service;
pub mod task;

pub use cluster::{Cluster, create_cluster};
pub use error::{ComputeError, ComputeResult};
pub use rotation::RoundRobin;
pub use service::{Service, ServiceSpec, Task, TargetRegistration, launch_service};
pub use task::{ContainerDefinition, PortMapping, TaskDefinition, validate_sizing};
