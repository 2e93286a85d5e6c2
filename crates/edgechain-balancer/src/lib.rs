//! edgechain-balancer: the two-tier balancer chain.
//!
//! ```text
//! client ──TCP/443──▶ NetworkBalancer (internet-facing, public tier)
//!                        │ target: ListenerHandle of the HTTPS listener
//!                        ▼
//!                     ApplicationBalancer (internal)
//!                        ├── HTTP/80   → 301 https://host:443/path?query
//!                        └── HTTPS/443 → TLS terminated, forward to target group
//!                                           │
//!                                           ▼
//!                                        tasks, HTTP/3000
//! ```
//!
//! The edge balancer never sees HTTP; every protocol decision (redirect,
//! TLS) lives in the internal balancer. The edge holds a read-only
//! [`ListenerHandle`] to the internal HTTPS listener, never the listener
//! itself.

pub mod application;
pub mod certificate;
pub mod chain;
pub mod error;
pub mod listener;
pub mod network;
pub mod target_group;

pub use application::{ApplicationBalancer, create_internal_balancer};
pub use certificate::{
    ArnCertificateStore, CertificateError, CertificateRef, CertificateStore, ResolvedCertificate,
    StaticCertificateStore,
};
pub use chain::{PortChain, verify_port_chain};
pub use error::{BalancerError, BalancerResult};
pub use listener::{Listener, ListenerAction, ListenerHandle, ListenerState, RedirectAction};
pub use network::{NetworkBalancer, create_external_balancer};
pub use target_group::{Target, TargetGroup, TargetKind};

/// Response header naming the target that served a forwarded request.
pub const TARGET_HEADER: &str = "x-edgechain-target";
