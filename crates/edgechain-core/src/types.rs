//! Shared types used across edgechain crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport or application protocol carried by a rule, listener, or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
}

impl Protocol {
    /// The transport protocol a security-group rule has to admit for this protocol.
    pub fn transport(self) -> Protocol {
        match self {
            Protocol::Udp => Protocol::Udp,
            _ => Protocol::Tcp,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a subnet tier has a route to the public internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Isolated,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => f.write_str("public"),
            Visibility::Isolated => f.write_str("isolated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Balancer exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    Internal,
    InternetFacing,
}

/// The layer a balancer operates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Application,
    Network,
}

/// Control-plane services the isolated tier reaches through private endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointService {
    /// Image registry API (auth tokens, manifests).
    RegistryApi,
    /// Image registry data plane (layer downloads).
    RegistryData,
    /// Object storage, where image layers are ultimately stored.
    Storage,
    Logs,
    Metrics,
}

impl EndpointService {
    pub const ALL: [EndpointService; 5] = [
        EndpointService::RegistryApi,
        EndpointService::RegistryData,
        EndpointService::Storage,
        EndpointService::Logs,
        EndpointService::Metrics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointService::RegistryApi => "registry-api",
            EndpointService::RegistryData => "registry-data",
            EndpointService::Storage => "storage",
            EndpointService::Logs => "logs",
            EndpointService::Metrics => "metrics",
        }
    }

    /// The public hostname the container platform calls for this service.
    ///
    /// Interface endpoints with private DNS make this name resolve to
    /// in-fabric addresses, so callers need no configuration change.
    pub fn hostname(self, region: &str) -> String {
        match self {
            EndpointService::RegistryApi => format!("api.ecr.{region}.amazonaws.com"),
            EndpointService::RegistryData => format!("dkr.ecr.{region}.amazonaws.com"),
            EndpointService::Storage => format!("s3.{region}.amazonaws.com"),
            EndpointService::Logs => format!("logs.{region}.amazonaws.com"),
            EndpointService::Metrics => format!("monitoring.{region}.amazonaws.com"),
        }
    }

    /// Endpoint type the platform offers for this service.
    pub fn default_type(self) -> EndpointType {
        match self {
            EndpointService::Storage => EndpointType::Gateway,
            _ => EndpointType::Interface,
        }
    }
}

impl fmt::Display for EndpointService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Network interfaces in each subnet, guarded by a security group.
    Interface,
    /// Route-table entry towards the service prefix list.
    Gateway,
}

/// Port a health check probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckPort {
    /// The port each target was registered with.
    TrafficPort,
    Port(u16),
}

impl HealthCheckPort {
    /// Resolve against the port a target is registered on.
    pub fn resolve(self, traffic_port: u16) -> u16 {
        match self {
            HealthCheckPort::TrafficPort => traffic_port,
            HealthCheckPort::Port(p) => p,
        }
    }
}

/// Health check parameters attached to a target group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub enabled: bool,
    pub protocol: Protocol,
    /// HTTP(S) path to probe. Ignored for TCP checks.
    pub path: String,
    pub port: HealthCheckPort,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive successes before a target is considered healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before a target is considered unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: Protocol::Http,
            path: "/".to_string(),
            port: HealthCheckPort::TrafficPort,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

impl HealthCheckSpec {
    /// Check the parameters against the ranges the platform accepts.
    pub fn validate(&self) -> Result<(), String> {
        if !(2..=10).contains(&self.healthy_threshold) {
            return Err(format!(
                "healthy threshold {} outside 2..=10",
                self.healthy_threshold
            ));
        }
        if !(2..=10).contains(&self.unhealthy_threshold) {
            return Err(format!(
                "unhealthy threshold {} outside 2..=10",
                self.unhealthy_threshold
            ));
        }
        if self.interval < Duration::from_secs(5) || self.interval > Duration::from_secs(300) {
            return Err(format!("interval {:?} outside 5s..=300s", self.interval));
        }
        if self.timeout.is_zero() || self.timeout >= self.interval {
            return Err(format!(
                "timeout {:?} must be non-zero and shorter than interval {:?}",
                self.timeout, self.interval
            ));
        }
        if matches!(self.protocol, Protocol::Http | Protocol::Https) && !self.path.starts_with('/') {
            return Err(format!("probe path {:?} must start with '/'", self.path));
        }
        if self.port == HealthCheckPort::Port(0) {
            return Err("probe port must be non-zero".to_string());
        }
        Ok(())
    }
}
