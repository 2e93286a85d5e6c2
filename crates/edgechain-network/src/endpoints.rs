//! Private endpoints: control-plane reachability for the isolated tier.
//!
//! Interface endpoints place one address per zone in the tier's subnets,
//! are guarded by a security group, and publish the service's regional
//! hostname into the private zone so callers need no configuration change.
//! Gateway endpoints (object storage only) add a prefix-list route to the
//! tier's route tables and involve no security group.
//!
//! Whether a caller can actually use an endpoint is a runtime property:
//! [`EndpointFabric::connect`] evaluates DNS, routing and the reachability
//! policy the way a connection attempt would, and reports a
//! [`ReachabilityError`] instead of failing provisioning.

use std::net::Ipv4Addr;

use edgechain_core::{EndpointService, EndpointType, Protocol};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::dns::{DEFAULT_TTL, PrivateDns};
use crate::error::{NetworkError, NetworkResult};
use crate::fabric::{Fabric, Route, RouteDestination, RouteTarget};
use crate::policy::{GroupHandle, ReachabilityPolicy};

/// Interface addresses start at this host offset within each subnet.
const INTERFACE_HOST_BASE: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub service: EndpointService,
    pub kind: EndpointType,
    pub tier: String,
    pub group: Option<GroupHandle>,
    pub private_dns: bool,
    pub port: u16,
}

impl EndpointRequest {
    pub fn interface(service: EndpointService, tier: &str, group: GroupHandle, port: u16) -> Self {
        Self {
            service,
            kind: EndpointType::Interface,
            tier: tier.to_string(),
            group: Some(group),
            private_dns: true,
            port,
        }
    }

    pub fn gateway(service: EndpointService, tier: &str) -> Self {
        Self {
            service,
            kind: EndpointType::Gateway,
            tier: tier.to_string(),
            group: None,
            private_dns: false,
            port: 443,
        }
    }

    /// Build the request a service gets by default: gateway for storage,
    /// interface for everything else.
    pub fn for_service(service: EndpointService, tier: &str, group: GroupHandle, port: u16) -> Self {
        match service.default_type() {
            EndpointType::Gateway => Self::gateway(service, tier),
            EndpointType::Interface => Self::interface(service, tier, group, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInterface {
    pub subnet: String,
    pub zone: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateEndpoint {
    pub id: String,
    pub service: EndpointService,
    pub kind: EndpointType,
    pub tier: String,
    pub group: Option<GroupHandle>,
    pub private_dns: bool,
    /// Regional hostname of the service.
    pub hostname: String,
    pub port: u16,
    /// One per zone, interface endpoints only.
    pub interfaces: Vec<EndpointInterface>,
    /// Route table id and the route this endpoint adds to it, gateway endpoints only.
    pub routes: Vec<(String, Route)>,
}

impl PrivateEndpoint {
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.interfaces.iter().map(|i| i.address).collect()
    }

    fn routes_table(&self, route_table: &str) -> bool {
        self.routes.iter().any(|(id, _)| id == route_table)
    }
}

/// Validate a request against the (finalized) fabric and policy and lay out
/// the endpoint. Reads only; safe to run for several services concurrently.
pub fn attach_endpoint(
    fabric: &Fabric,
    policy: &ReachabilityPolicy,
    request: &EndpointRequest,
) -> NetworkResult<PrivateEndpoint> {
    let subnets = fabric.tier_subnets(&request.tier)?;
    let id = endpoint_id(fabric, request);
    let hostname = request.service.hostname(&fabric.region);

    let mut endpoint = PrivateEndpoint {
        id: id.clone(),
        service: request.service,
        kind: request.kind,
        tier: request.tier.clone(),
        group: request.group,
        private_dns: request.private_dns,
        hostname,
        port: request.port,
        interfaces: Vec::new(),
        routes: Vec::new(),
    };

    match request.kind {
        EndpointType::Interface => {
            let group = request.group.ok_or_else(|| {
                NetworkError::endpoint(format!("{}: interface endpoint needs a security group", request.service))
            })?;
            if !request.private_dns {
                return Err(NetworkError::endpoint(format!(
                    "{}: interface endpoint must enable private DNS",
                    request.service
                )));
            }
            let sg = policy.group(group)?;
            if let Some(bound) = &sg.tier
                && bound != &request.tier
            {
                return Err(NetworkError::endpoint(format!(
                    "{}: group {} is bound to tier {bound}, endpoint is in {}",
                    request.service, sg.name, request.tier
                )));
            }
            let offset = INTERFACE_HOST_BASE + ordinal(request.service);
            for subnet in subnets {
                let address = subnet.host(offset).ok_or_else(|| {
                    NetworkError::AddressSpace(format!("{} has no room for endpoint {}", subnet.cidr, request.service))
                })?;
                endpoint.interfaces.push(EndpointInterface {
                    subnet: subnet.id.clone(),
                    zone: subnet.zone.clone(),
                    address,
                });
            }
        }
        EndpointType::Gateway => {
            if request.service.default_type() != EndpointType::Gateway {
                return Err(NetworkError::endpoint(format!(
                    "{} has no gateway endpoint",
                    request.service
                )));
            }
            if request.group.is_some() {
                return Err(NetworkError::endpoint(format!(
                    "{}: gateway endpoints are routed, not guarded by a security group",
                    request.service
                )));
            }
            let prefix_list = format!("pl-{}-{}", request.service, fabric.region);
            for subnet in subnets {
                endpoint.routes.push((
                    subnet.route_table.clone(),
                    Route {
                        destination: RouteDestination::PrefixList(prefix_list.clone()),
                        target: RouteTarget::GatewayEndpoint(id.clone()),
                    },
                ));
            }
        }
    }

    debug!(
        endpoint = %endpoint.id,
        service = %request.service,
        kind = ?request.kind,
        tier = %request.tier,
        "endpoint attached"
    );
    Ok(endpoint)
}

fn ordinal(service: EndpointService) -> u32 {
    EndpointService::ALL
        .iter()
        .position(|s| *s == service)
        .unwrap_or(0) as u32
}

fn endpoint_id(fabric: &Fabric, request: &EndpointRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fabric.id.as_bytes());
    hasher.update(request.service.as_str().as_bytes());
    hasher.update(request.tier.as_bytes());
    format!("vpce-{}", &hex::encode(hasher.finalize())[..12])
}

// ── Runtime reachability ──────────────────────────────────────────

/// A workload attempting to reach a control-plane service.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub group: GroupHandle,
    pub subnet: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPath {
    InterfaceEndpoint(String),
    GatewayEndpoint(String),
    Internet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub service: EndpointService,
    pub hostname: String,
    pub address: Option<Ipv4Addr>,
    pub path: ConnectionPath,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReachabilityError {
    #[error("{hostname} ({service}): no route from subnet {subnet}")]
    NoRoute {
        service: EndpointService,
        hostname: String,
        subnet: String,
    },

    #[error("{service}: connection refused by {address}:{port}")]
    ConnectionRefused {
        service: EndpointService,
        address: Ipv4Addr,
        port: u16,
    },

    #[error("caller subnet {0} is not part of the fabric")]
    UnknownSubnet(String),

    #[error("target {target} never became healthy: {reason}")]
    Unhealthy { target: String, reason: String },
}

/// All endpoints of an environment plus the private zone they publish into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointFabric {
    endpoints: Vec<PrivateEndpoint>,
    dns: PrivateDns,
}

impl EndpointFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, endpoint: PrivateEndpoint) {
        if endpoint.kind == EndpointType::Interface && endpoint.private_dns {
            self.dns.upsert(&endpoint.hostname, endpoint.addresses(), DEFAULT_TTL);
        }
        self.endpoints.retain(|e| e.id != endpoint.id);
        self.endpoints.push(endpoint);
    }

    pub fn remove(&mut self, id: &str) -> Option<PrivateEndpoint> {
        let pos = self.endpoints.iter().position(|e| e.id == id)?;
        let endpoint = self.endpoints.remove(pos);
        if endpoint.private_dns {
            self.dns.remove(&endpoint.hostname);
        }
        Some(endpoint)
    }

    pub fn endpoints(&self) -> &[PrivateEndpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, service: EndpointService) -> Option<&PrivateEndpoint> {
        self.endpoints.iter().find(|e| e.service == service)
    }

    pub fn dns(&self) -> &PrivateDns {
        &self.dns
    }

    /// Simulate `caller` opening a TLS connection to `service`'s regional
    /// hostname.
    pub fn connect(
        &self,
        fabric: &Fabric,
        policy: &ReachabilityPolicy,
        caller: &Caller<'_>,
        service: EndpointService,
    ) -> Result<Connection, ReachabilityError> {
        let subnet = fabric
            .subnet(caller.subnet)
            .ok_or_else(|| ReachabilityError::UnknownSubnet(caller.subnet.to_string()))?;
        let hostname = service.hostname(&fabric.region);

        // Gateway routes win over public resolution for prefix-list traffic.
        if let Some(gateway) = self
            .endpoints
            .iter()
            .find(|e| e.service == service && e.kind == EndpointType::Gateway && e.routes_table(&subnet.route_table))
        {
            return Ok(Connection {
                service,
                hostname,
                address: None,
                path: ConnectionPath::GatewayEndpoint(gateway.id.clone()),
            });
        }

        if let Some(record) = self.dns.resolve(&hostname) {
            let endpoint = self
                .endpoints
                .iter()
                .find(|e| e.private_dns && e.hostname == record.hostname);
            // Prefer the interface in the caller's zone.
            let address = endpoint
                .and_then(|e| e.interfaces.iter().find(|i| i.zone == subnet.zone))
                .map(|i| i.address)
                .or_else(|| record.addresses.first().copied());
            if let (Some(endpoint), Some(address)) = (endpoint, address) {
                let admitted = endpoint
                    .group
                    .is_some_and(|g| policy.permits(caller.group, g, Protocol::Tcp, endpoint.port));
                if !admitted {
                    return Err(ReachabilityError::ConnectionRefused {
                        service,
                        address,
                        port: endpoint.port,
                    });
                }
                return Ok(Connection {
                    service,
                    hostname,
                    address: Some(address),
                    path: ConnectionPath::InterfaceEndpoint(endpoint.id.clone()),
                });
            }
        }

        if fabric.has_internet_route(&subnet.id) {
            return Ok(Connection {
                service,
                hostname,
                address: None,
                path: ConnectionPath::Internet,
            });
        }
        Err(ReachabilityError::NoRoute {
            service,
            hostname,
            subnet: subnet.id.clone(),
        })
    }

    /// Everything an image pull touches: registry API, registry data plane,
    /// and the object storage holding the layers.
    pub fn verify_image_pull(
        &self,
        fabric: &Fabric,
        policy: &ReachabilityPolicy,
        caller: &Caller<'_>,
    ) -> Result<Vec<Connection>, ReachabilityError> {
        self.verify(
            fabric,
            policy,
            caller,
            &[
                EndpointService::RegistryApi,
                EndpointService::RegistryData,
                EndpointService::Storage,
            ],
        )
    }

    /// Log and metric sinks.
    pub fn verify_telemetry(
        &self,
        fabric: &Fabric,
        policy: &ReachabilityPolicy,
        caller: &Caller<'_>,
    ) -> Result<Vec<Connection>, ReachabilityError> {
        self.verify(fabric, policy, caller, &[EndpointService::Logs, EndpointService::Metrics])
    }

    fn verify(
        &self,
        fabric: &Fabric,
        policy: &ReachabilityPolicy,
        caller: &Caller<'_>,
        services: &[EndpointService],
    ) -> Result<Vec<Connection>, ReachabilityError> {
        let connections = services
            .iter()
            .map(|s| self.connect(fabric, policy, caller, *s))
            .collect::<Result<Vec<_>, _>>()?;
        info!(subnet = caller.subnet, services = services.len(), "control-plane reachability verified");
        Ok(connections)
    }
}
