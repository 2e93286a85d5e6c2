//! edgechain.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::image::ImageRef;
use crate::types::{EndpointService, HealthCheckPort, HealthCheckSpec, Protocol, Visibility};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub stack: StackMeta,
    pub network: NetworkConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    pub service: ServiceConfig,
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub external: ExternalConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackMeta {
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_cidr")]
    pub cidr: Ipv4Net,
    pub zones: Vec<String>,
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub cidr_mask: u8,
    pub visibility: Visibility,
    /// Zones this tier is replicated in. Defaults to every fabric zone.
    pub zones: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Tier the interface endpoints are placed in. Defaults to the first isolated tier.
    pub tier: Option<String>,
    #[serde(default = "default_endpoint_services")]
    pub services: Vec<EndpointService>,
    /// Port the control-plane services are reached on.
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Security groups admitted to the interface endpoints on `port`.
    #[serde(default = "default_allow_from")]
    pub allow_from: Vec<String>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            tier: None,
            services: default_endpoint_services(),
            port: default_https_port(),
            allow_from: default_allow_from(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory")]
    pub memory_mib: u32,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub container_port: u16,
    /// Tier the tasks run in. Defaults to the first isolated tier.
    pub tier: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub certificate: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Tier the internal balancer is placed in. Defaults to the first isolated tier.
    pub tier: Option<String>,
    #[serde(default)]
    pub health: HealthCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Tier the external balancer binds to. Defaults to the first public tier.
    pub tier: Option<String>,
    #[serde(default)]
    pub health: HealthCheckConfig,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            port: default_https_port(),
            tier: None,
            health: HealthCheckConfig::default(),
        }
    }
}

/// Health check overrides; unset fields fall back to the tier's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: Option<bool>,
    pub protocol: Option<Protocol>,
    pub path: Option<String>,
    /// A port number or `"traffic-port"`.
    pub port: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Upper bound on a single resource-creation call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,
    /// Attempts for transient failures of idempotent calls.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_cidr() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16).expect("static prefix length")
}
fn default_endpoint_services() -> Vec<EndpointService> {
    EndpointService::ALL.to_vec()
}
fn default_allow_from() -> Vec<String> {
    vec!["compute".to_string()]
}
fn default_container_name() -> String {
    "app".to_string()
}
fn default_cpu() -> u32 {
    256
}
fn default_memory() -> u32 {
    512
}
fn default_replicas() -> u32 {
    1
}
fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}
fn default_call_timeout() -> String {
    "5m".to_string()
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff() -> String {
    "1s".to_string()
}
fn default_max_backoff() -> String {
    "30s".to_string()
}

impl HealthCheckConfig {
    /// Overlay these overrides on `defaults` and validate the result.
    pub fn resolve(&self, defaults: HealthCheckSpec) -> Result<HealthCheckSpec, ConfigError> {
        let mut spec = defaults;
        if let Some(enabled) = self.enabled {
            spec.enabled = enabled;
        }
        if let Some(protocol) = self.protocol {
            spec.protocol = protocol;
        }
        if let Some(path) = &self.path {
            spec.path = path.clone();
        }
        if let Some(port) = &self.port {
            spec.port = parse_health_port(port)?;
        }
        if let Some(interval) = &self.interval {
            spec.interval = duration_field("health.interval", interval)?;
        }
        if let Some(timeout) = &self.timeout {
            spec.timeout = duration_field("health.timeout", timeout)?;
        }
        if let Some(n) = self.healthy_threshold {
            spec.healthy_threshold = n;
        }
        if let Some(n) = self.unhealthy_threshold {
            spec.unhealthy_threshold = n;
        }
        spec.validate().map_err(ConfigError::Invalid)?;
        Ok(spec)
    }
}

fn parse_health_port(s: &str) -> Result<HealthCheckPort, ConfigError> {
    if s.eq_ignore_ascii_case("traffic-port") {
        return Ok(HealthCheckPort::TrafficPort);
    }
    s.parse::<u16>()
        .map(HealthCheckPort::Port)
        .map_err(|_| ConfigError::invalid(format!("health.port {s:?} is not a port")))
}

fn duration_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
        .ok_or_else(|| ConfigError::invalid(format!("{field} {value:?} is not a duration")))
}

/// Provisioning knobs with durations parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSettings {
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ProvisioningConfig {
    pub fn settings(&self) -> Result<ProvisioningSettings, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("provisioning.max_attempts must be at least 1"));
        }
        Ok(ProvisioningSettings {
            call_timeout: duration_field("provisioning.call_timeout", &self.call_timeout)?,
            max_attempts: self.max_attempts,
            initial_backoff: duration_field("provisioning.initial_backoff", &self.initial_backoff)?,
            max_backoff: duration_field("provisioning.max_backoff", &self.max_backoff)?,
        })
    }
}

impl StackConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Shallow validation of fields that need no topology context.
    ///
    /// Zone counts, tier membership, and port chains are checked by the
    /// components that build them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack.name.trim().is_empty() {
            return Err(ConfigError::invalid("stack.name is empty"));
        }
        if self.stack.region.trim().is_empty() {
            return Err(ConfigError::invalid("stack.region is empty"));
        }
        if self.service.container_port == 0 {
            return Err(ConfigError::invalid("service.container_port must be non-zero"));
        }
        if self.service.container_name.trim().is_empty() {
            return Err(ConfigError::invalid("service.container_name is empty"));
        }
        ImageRef::parse(&self.service.image)
            .map_err(|e| ConfigError::invalid(format!("service.image: {e}")))?;
        if self.balancer.certificate.trim().is_empty() {
            return Err(ConfigError::invalid("balancer.certificate is empty"));
        }
        if self.balancer.http_port == self.balancer.https_port {
            return Err(ConfigError::invalid(
                "balancer.http_port and balancer.https_port must differ",
            ));
        }
        self.internal_health()?;
        self.external_health()?;
        self.provisioning.settings()?;
        Ok(())
    }

    /// Health check for the internal balancer's target group (the tasks).
    pub fn internal_health(&self) -> Result<HealthCheckSpec, ConfigError> {
        self.balancer.health.resolve(HealthCheckSpec {
            protocol: Protocol::Http,
            port: HealthCheckPort::TrafficPort,
            ..HealthCheckSpec::default()
        })
    }

    /// Health check for the external balancer's target group (the internal listener).
    pub fn external_health(&self) -> Result<HealthCheckSpec, ConfigError> {
        self.external.health.resolve(HealthCheckSpec {
            protocol: Protocol::Https,
            port: HealthCheckPort::Port(self.balancer.https_port),
            ..HealthCheckSpec::default()
        })
    }

    /// Scaffold the reference stack: two zones, one public and one isolated
    /// `/24` tier per zone, a single replica on port 3000.
    pub fn scaffold(name: &str, region: &str, image: &str, certificate: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "3000".to_string());
        env.insert("NODE_ENV".to_string(), "production".to_string());

        StackConfig {
            stack: StackMeta {
                name: name.to_string(),
                region: region.to_string(),
            },
            network: NetworkConfig {
                cidr: default_cidr(),
                zones: vec![format!("{region}a"), format!("{region}b")],
                tiers: vec![
                    TierConfig {
                        name: "Public".to_string(),
                        cidr_mask: 24,
                        visibility: Visibility::Public,
                        zones: None,
                    },
                    TierConfig {
                        name: "Private".to_string(),
                        cidr_mask: 24,
                        visibility: Visibility::Isolated,
                        zones: None,
                    },
                ],
            },
            endpoints: EndpointsConfig::default(),
            service: ServiceConfig {
                name: name.to_string(),
                image: image.to_string(),
                container_name: "appContainer".to_string(),
                cpu: default_cpu(),
                memory_mib: default_memory(),
                replicas: 1,
                container_port: 3000,
                tier: None,
                env,
            },
            balancer: BalancerConfig {
                certificate: certificate.to_string(),
                http_port: 80,
                https_port: 443,
                tier: None,
                health: HealthCheckConfig {
                    path: Some("/".to_string()),
                    port: Some("3000".to_string()),
                    protocol: Some(Protocol::Http),
                    interval: Some("30s".to_string()),
                    timeout: Some("5s".to_string()),
                    healthy_threshold: Some(2),
                    unhealthy_threshold: Some(3),
                    enabled: None,
                },
            },
            external: ExternalConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = "arn:aws:acm:ca-central-1:111122223333:certificate/0b1f1c2e-4d5a-4f7e-9a3b-7c6d5e4f3a2b";

    fn scaffold() -> StackConfig {
        StackConfig::scaffold("fin-chat", "ca-central-1", "registry.local/fin-chat:v1", CERT)
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let toml_str = scaffold().to_toml_string().unwrap();
        assert!(toml_str.contains("fin-chat"));
        let back = StackConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(back.network.zones, vec!["ca-central-1a", "ca-central-1b"]);
        assert_eq!(back.service.env.get("PORT").map(String::as_str), Some("3000"));
        back.validate().unwrap();
    }

    #[test]
    fn parse_minimal_applies_defaults() {
        let toml_str = r#"
[stack]
name = "demo"
region = "eu-west-1"

[network]
zones = ["eu-west-1a", "eu-west-1b"]

[[network.tiers]]
name = "Public"
cidr_mask = 24
visibility = "public"

[[network.tiers]]
name = "Private"
cidr_mask = 24
visibility = "isolated"

[service]
name = "demo"
image = "demo:1"
container_port = 8080

[balancer]
certificate = "arn:aws:acm:eu-west-1:111122223333:certificate/abc"
"#;
        let config = StackConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.network.cidr.to_string(), "10.0.0.0/16");
        assert_eq!(config.endpoints.services.len(), 5);
        assert_eq!(config.balancer.https_port, 443);
        assert_eq!(config.service.memory_mib, 512);
        config.validate().unwrap();

        let internal = config.internal_health().unwrap();
        assert_eq!(internal.protocol, Protocol::Http);
        assert_eq!(internal.port, HealthCheckPort::TrafficPort);

        let external = config.external_health().unwrap();
        assert_eq!(external.protocol, Protocol::Https);
        assert_eq!(external.port, HealthCheckPort::Port(443));
    }

    #[test]
    fn health_overrides_apply() {
        let overrides = HealthCheckConfig {
            interval: Some("10s".to_string()),
            healthy_threshold: Some(5),
            port: Some("traffic-port".to_string()),
            ..Default::default()
        };
        let spec = overrides.resolve(HealthCheckSpec::default()).unwrap();
        assert_eq!(spec.interval, Duration::from_secs(10));
        assert_eq!(spec.healthy_threshold, 5);
        assert_eq!(spec.port, HealthCheckPort::TrafficPort);
    }

    #[test]
    fn bad_health_duration_is_invalid() {
        let overrides = HealthCheckConfig {
            timeout: Some("quick".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            overrides.resolve(HealthCheckSpec::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn same_listener_ports_rejected() {
        let mut config = scaffold();
        config.balancer.http_port = 443;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_image_rejected() {
        let mut config = scaffold();
        config.service.image = "app@sha256:nope".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provisioning_settings_parse() {
        let settings = ProvisioningConfig::default().settings().unwrap();
        assert_eq!(settings.call_timeout, Duration::from_secs(300));
        assert_eq!(settings.max_attempts, 4);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgechain.toml");
        std::fs::write(&path, scaffold().to_toml_string().unwrap()).unwrap();
        let config = StackConfig::from_file(&path).unwrap();
        assert_eq!(config.stack.name, "fin-chat");
    }
}
