//! Network fabric: a virtual network split into zone-replicated subnet tiers.
//!
//! `create_fabric` is a pure function of its input: the same zones and tiers
//! always produce the same ids and the same address plan, which is what lets
//! the reconciler report "no changes" on re-apply.
//!
//! Address plan: tiers are carved from the fabric CIDR in declaration order,
//! one block per zone the tier is replicated in. Public tiers get a route
//! table with a default route to the internet gateway; isolated tiers get
//! only the local route.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use edgechain_core::Visibility;
use edgechain_core::config::NetworkConfig;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};

/// Smallest subnet the platform accepts.
const MAX_SUBNET_PREFIX: u8 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    pub cidr_mask: u8,
    pub visibility: Visibility,
    /// Zones the tier is replicated in; `None` means every fabric zone.
    pub zones: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricSpec {
    pub name: String,
    pub region: String,
    pub cidr: Ipv4Net,
    pub zones: Vec<String>,
    pub tiers: Vec<TierSpec>,
}

impl FabricSpec {
    pub fn from_config(name: &str, region: &str, network: &NetworkConfig) -> Self {
        Self {
            name: name.to_string(),
            region: region.to_string(),
            cidr: network.cidr,
            zones: network.zones.clone(),
            tiers: network
                .tiers
                .iter()
                .map(|t| TierSpec {
                    name: t.name.clone(),
                    cidr_mask: t.cidr_mask,
                    visibility: t.visibility,
                    zones: t.zones.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub tier: String,
    pub zone: String,
    pub cidr: Ipv4Net,
    pub visibility: Visibility,
    pub route_table: String,
}

impl Subnet {
    /// The `n`th usable host address. The first four addresses of every
    /// subnet are reserved by the platform.
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        let base = u32::from(self.cidr.network());
        let size = 1u64 << (32 - self.cidr.prefix_len());
        let offset = 4u64 + n as u64;
        // Last address is broadcast.
        (offset < size - 1).then(|| Ipv4Addr::from(base + offset as u32))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDestination {
    Cidr(Ipv4Net),
    /// A managed prefix list naming a service's public address ranges.
    PrefixList(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Local,
    InternetGateway(String),
    GatewayEndpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: RouteDestination,
    pub target: RouteTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: String,
    pub tier: String,
    pub zone: String,
    pub routes: Vec<Route>,
}

/// A built network fabric. Root of every environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fabric {
    pub id: String,
    pub name: String,
    pub region: String,
    pub cidr: Ipv4Net,
    pub zones: Vec<String>,
    pub tiers: Vec<TierSpec>,
    pub subnets: Vec<Subnet>,
    pub route_tables: Vec<RouteTable>,
    pub internet_gateway: Option<String>,
}

/// Build a fabric, failing fast on topologies that cannot give cross-zone
/// redundancy to both the public and the isolated side.
pub fn create_fabric(spec: &FabricSpec) -> NetworkResult<Fabric> {
    validate(spec)?;

    let id = format!("fab-{}", short_hash(spec));
    let internet_gateway = spec
        .tiers
        .iter()
        .any(|t| t.visibility == Visibility::Public)
        .then(|| format!("igw-{}", &id[4..]));

    let fabric_start = u32::from(spec.cidr.network()) as u64;
    let fabric_end = fabric_start + (1u64 << (32 - spec.cidr.prefix_len()));
    let mut cursor = fabric_start;

    let mut subnets = Vec::new();
    let mut route_tables = Vec::new();

    for tier in &spec.tiers {
        let block = 1u64 << (32 - tier.cidr_mask);
        for zone in tier_zones(spec, tier) {
            // Align to the block size.
            cursor = cursor.div_ceil(block) * block;
            if cursor + block > fabric_end {
                return Err(NetworkError::AddressSpace(format!(
                    "{} has no room for a /{} in {zone} for tier {}",
                    spec.cidr, tier.cidr_mask, tier.name
                )));
            }
            let cidr = Ipv4Net::new(Ipv4Addr::from(cursor as u32), tier.cidr_mask)
                .map_err(|e| NetworkError::topology(e.to_string()))?;
            cursor += block;

            let suffix = format!("{}-{zone}", slug(&tier.name));
            let rtb_id = format!("rtb-{}-{suffix}", &id[4..]);

            let mut routes = vec![Route {
                destination: RouteDestination::Cidr(spec.cidr),
                target: RouteTarget::Local,
            }];
            if tier.visibility == Visibility::Public
                && let Some(igw) = &internet_gateway
            {
                routes.push(Route {
                    destination: RouteDestination::Cidr(default_route()),
                    target: RouteTarget::InternetGateway(igw.clone()),
                });
            }

            debug!(tier = %tier.name, %zone, %cidr, "allocated subnet");

            subnets.push(Subnet {
                id: format!("subnet-{}-{suffix}", &id[4..]),
                tier: tier.name.clone(),
                zone: zone.clone(),
                cidr,
                visibility: tier.visibility,
                route_table: rtb_id.clone(),
            });
            route_tables.push(RouteTable {
                id: rtb_id,
                tier: tier.name.clone(),
                zone,
                routes,
            });
        }
    }

    info!(
        fabric = %id,
        region = %spec.region,
        subnets = subnets.len(),
        "fabric built"
    );

    Ok(Fabric {
        id,
        name: spec.name.clone(),
        region: spec.region.clone(),
        cidr: spec.cidr,
        zones: spec.zones.clone(),
        tiers: spec.tiers.clone(),
        subnets,
        route_tables,
        internet_gateway,
    })
}

fn validate(spec: &FabricSpec) -> NetworkResult<()> {
    if spec.zones.len() < 2 {
        return Err(NetworkError::topology(format!(
            "at least 2 zones required, got {}",
            spec.zones.len()
        )));
    }
    let mut seen = HashSet::new();
    for zone in &spec.zones {
        if !seen.insert(zone) {
            return Err(NetworkError::topology(format!("zone {zone} listed twice")));
        }
    }

    let mut names = HashSet::new();
    for tier in &spec.tiers {
        if !names.insert(tier.name.as_str()) {
            return Err(NetworkError::topology(format!("tier {} declared twice", tier.name)));
        }
        if tier.cidr_mask <= spec.cidr.prefix_len() || tier.cidr_mask > MAX_SUBNET_PREFIX {
            return Err(NetworkError::topology(format!(
                "tier {} mask /{} must be within /{}..=/{MAX_SUBNET_PREFIX}",
                tier.name,
                tier.cidr_mask,
                spec.cidr.prefix_len() + 1
            )));
        }
        if let Some(zones) = &tier.zones {
            for zone in zones {
                if !spec.zones.contains(zone) {
                    return Err(NetworkError::topology(format!(
                        "tier {} names zone {zone} which is not in the fabric",
                        tier.name
                    )));
                }
            }
        }
        let replicated = tier_zones(spec, tier).len();
        if replicated < 2 {
            return Err(NetworkError::topology(format!(
                "tier {} spans {replicated} zone(s); at least 2 are required",
                tier.name
            )));
        }
    }

    for visibility in [Visibility::Public, Visibility::Isolated] {
        if !spec.tiers.iter().any(|t| t.visibility == visibility) {
            return Err(NetworkError::topology(format!("no {visibility} tier declared")));
        }
    }
    Ok(())
}

/// Zones a tier is replicated in, deduplicated, in fabric order.
fn tier_zones(spec: &FabricSpec, tier: &TierSpec) -> Vec<String> {
    match &tier.zones {
        None => spec.zones.clone(),
        Some(zones) => spec
            .zones
            .iter()
            .filter(|z| zones.contains(z))
            .cloned()
            .collect(),
    }
}

fn default_route() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("zero prefix is valid")
}

fn short_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(&Sha256::digest(&bytes)[..6])
}

fn slug(name: &str) -> String {
    name.to_ascii_lowercase().replace(|c: char| !c.is_ascii_alphanumeric(), "-")
}

impl Fabric {
    pub fn tier(&self, name: &str) -> NetworkResult<&TierSpec> {
        self.tiers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| NetworkError::UnknownTier(name.to_string()))
    }

    /// First declared tier with the given visibility.
    pub fn first_tier(&self, visibility: Visibility) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.visibility == visibility)
    }

    /// Subnets of a tier, one per zone.
    pub fn tier_subnets(&self, name: &str) -> NetworkResult<Vec<&Subnet>> {
        self.tier(name)?;
        Ok(self.subnets.iter().filter(|s| s.tier == name).collect())
    }

    pub fn subnet(&self, id: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.id == id)
    }

    pub fn route_table(&self, id: &str) -> Option<&RouteTable> {
        self.route_tables.iter().find(|r| r.id == id)
    }

    /// Whether a subnet can reach the public internet.
    pub fn has_internet_route(&self, subnet_id: &str) -> bool {
        self.subnet(subnet_id)
            .and_then(|s| self.route_table(&s.route_table))
            .is_some_and(|rt| {
                rt.routes
                    .iter()
                    .any(|r| matches!(r.target, RouteTarget::InternetGateway(_)))
            })
    }

    /// Resolve a tier by name or fall back to the first tier of a visibility.
    pub fn tier_or_first(&self, name: Option<&str>, visibility: Visibility) -> NetworkResult<&TierSpec> {
        match name {
            Some(name) => self.tier(name),
            None => self
                .first_tier(visibility)
                .ok_or_else(|| NetworkError::topology(format!("no {visibility} tier declared"))),
        }
    }
}
