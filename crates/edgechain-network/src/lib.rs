//! edgechain-network: the network side of an environment.
//!
//! # Components
//!
//! - **`fabric`**: virtual network carved into public and isolated subnet tiers across zones
//! - **`policy`**: security groups and the allow rules between them (default-deny)
//! - **`endpoints`**: interface and gateway endpoints giving the isolated tier private
//!   reachability to control-plane services, plus the runtime reachability check
//! - **`dns`**: private hosted zone that interface endpoints publish their addresses into
//!
//! The fabric and policy are finalized before any endpoint is attached and
//! are only read afterwards, so endpoints can be attached concurrently.

pub mod dns;
pub mod endpoints;
pub mod error;
pub mod fabric;
pub mod policy;

pub use dns::{DnsRecord, PrivateDns};
pub use endpoints::{
    Caller, Connection, ConnectionPath, EndpointFabric, EndpointInterface, EndpointRequest,
    PrivateEndpoint, ReachabilityError,
    attach_endpoint,
};
pub use error::{NetworkError, NetworkResult};
pub use fabric::{Fabric, FabricSpec, Route, RouteDestination, RouteTable, RouteTarget, Subnet, TierSpec, create_fabric};
pub use policy::{GroupHandle, Peer, ReachabilityPolicy, Rule, SecurityGroup};
