//! Internet-facing network-layer balancer.
//!
//! Forwards raw TCP. It has no view into TLS or HTTP, so it cannot redirect
//! or inspect anything; its only target is the internal balancer's TLS
//! listener, referenced through a [`ListenerHandle`].

use std::net::Ipv4Addr;

use edgechain_core::{HealthCheckSpec, Layer, Protocol, Scheme, Visibility};
use edgechain_network::Fabric;
use edgechain_state::TargetHealthState;
use http::{Request, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::{ApplicationBalancer, refresh_listeners, short_hash};
use crate::error::{BalancerError, BalancerResult};
use crate::listener::{Listener, ListenerAction, ListenerHandle, ListenerState};
use crate::target_group::{TargetGroup, TargetKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkBalancer {
    pub id: String,
    pub name: String,
    pub scheme: Scheme,
    pub layer: Layer,
    pub tier: String,
    pub dns_name: String,
    /// Publicly routable address per zone.
    pub addresses: Vec<Ipv4Addr>,
    listeners: Vec<Listener>,
    target_groups: Vec<TargetGroup>,
}

/// Create the edge balancer on a public tier. Tiers without an internet
/// route are rejected; an internet-facing balancer there would be
/// unreachable.
pub fn create_external_balancer(fabric: &Fabric, name: &str, tier: &str) -> BalancerResult<NetworkBalancer> {
    let spec = fabric.tier(tier)?;
    if spec.visibility != Visibility::Public {
        return Err(BalancerError::configuration(format!(
            "internet-facing balancer needs a public tier, {tier} is {}",
            spec.visibility
        )));
    }
    let subnets = fabric.tier_subnets(tier)?;
    if let Some(s) = subnets.iter().find(|s| !fabric.has_internet_route(&s.id)) {
        return Err(BalancerError::configuration(format!("subnet {} has no internet route", s.id)));
    }

    let hash = short_hash(&[&fabric.id, name, tier]);
    // Elastic addresses from the documentation range, one per zone.
    let seed = u8::from_str_radix(&hash[..2], 16).unwrap_or(0) % 200;
    let addresses = (0..subnets.len())
        .map(|i| Ipv4Addr::new(198, 51, 100, seed.saturating_add(i as u8) + 1))
        .collect();

    let balancer = NetworkBalancer {
        id: format!("nlb-{name}-{hash}"),
        name: name.to_string(),
        scheme: Scheme::InternetFacing,
        layer: Layer::Network,
        tier: tier.to_string(),
        dns_name: format!("{name}-{hash}.elb.{}.amazonaws.com", fabric.region),
        addresses,
        listeners: Vec::new(),
        target_groups: Vec::new(),
    };
    info!(balancer = %balancer.id, tier, "external balancer created");
    Ok(balancer)
}

impl NetworkBalancer {
    /// TCP listener on `port` forwarding to `target`, health-checked with
    /// `health_check` against the target's own port.
    pub fn add_tcp_listener(
        &mut self,
        port: u16,
        target: &ListenerHandle,
        health_check: HealthCheckSpec,
    ) -> BalancerResult<ListenerHandle> {
        if self.listeners.iter().any(|l| l.port == port) {
            return Err(BalancerError::DuplicateListener(port));
        }
        if target.protocol != Protocol::Https {
            return Err(BalancerError::configuration(format!(
                "passthrough target {} must be a TLS listener, got {}",
                target.listener, target.protocol
            )));
        }
        let probe_port = health_check.port.resolve(target.port);
        if probe_port != target.port {
            return Err(BalancerError::PortMismatch {
                tier: "external health check".to_string(),
                expected: target.port,
                found: probe_port,
            });
        }

        let name = format!("{}-edge", self.name);
        let mut tg = TargetGroup::new(&name, Protocol::Tcp, target.port, TargetKind::Listener, health_check)?;
        tg.register_listener(target)?;
        let tg_id = tg.id.clone();
        self.target_groups.retain(|t| t.id != tg_id);
        self.target_groups.push(tg);

        let listener = Listener {
            id: format!("{}/listener/{port}", self.id),
            balancer: self.id.clone(),
            protocol: Protocol::Tcp,
            port,
            certificate: None,
            action: ListenerAction::Forward { target_group: tg_id },
            state: ListenerState::Created,
        };
        info!(listener = %listener.id, port, target = %target.listener, "listener created");
        let handle = listener.handle(&self.dns_name);
        self.listeners.push(listener);
        Ok(handle)
    }

    pub fn activate(&mut self) {
        for listener in &mut self.listeners {
            if listener.state == ListenerState::Created {
                listener.state = ListenerState::Listening;
            }
        }
    }

    /// The listener a connection on `port` is passed to.
    pub fn forward(&self, port: u16) -> BalancerResult<&ListenerHandle> {
        let listener = self.listener(port)?;
        if listener.state == ListenerState::Created {
            return Err(BalancerError::UnknownListener(port));
        }
        let tg_id = listener
            .target_group()
            .ok_or_else(|| BalancerError::configuration("network listener without target group"))?;
        self.target_group(tg_id)?
            .targets
            .iter()
            .find_map(|t| t.listener.as_ref())
            .ok_or_else(|| BalancerError::UnknownTargetGroup(tg_id.to_string()))
    }

    /// Pass a connection carrying `request` through to the internal balancer.
    /// The bytes are not looked at; the internal balancer answers.
    pub fn handle<B>(
        &self,
        port: u16,
        request: &Request<B>,
        internal: &ApplicationBalancer,
    ) -> BalancerResult<Response<()>> {
        let target = self.forward(port)?;
        if target.balancer != internal.id {
            return Err(BalancerError::configuration(format!(
                "listener {port} targets {}, not {}",
                target.balancer, internal.id
            )));
        }
        internal.handle(target.port, request)
    }

    pub fn set_target_health(
        &mut self,
        target_group: &str,
        target: &str,
        health: TargetHealthState,
        reason: Option<String>,
    ) -> BalancerResult<bool> {
        let changed = self
            .target_groups
            .iter_mut()
            .find(|tg| tg.id == target_group)
            .ok_or_else(|| BalancerError::UnknownTargetGroup(target_group.to_string()))?
            .set_health(target, health, reason);
        refresh_listeners(&mut self.listeners, &self.target_groups);
        Ok(changed)
    }

    pub fn listener(&self, port: u16) -> BalancerResult<&Listener> {
        self.listeners
            .iter()
            .find(|l| l.port == port)
            .ok_or(BalancerError::UnknownListener(port))
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn target_group(&self, id: &str) -> BalancerResult<&TargetGroup> {
        self.target_groups
            .iter()
            .find(|tg| tg.id == id)
            .ok_or_else(|| BalancerError::UnknownTargetGroup(id.to_string()))
    }

    pub fn target_groups(&self) -> &[TargetGroup] {
        &self.target_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TARGET_HEADER;
    use crate::application::tests::{balancer, env};
    use edgechain_core::HealthCheckPort;
    use http::StatusCode;

    fn edge_health() -> HealthCheckSpec {
        HealthCheckSpec {
            protocol: Protocol::Https,
            port: HealthCheckPort::Port(443),
            ..Default::default()
        }
    }

    #[test]
    fn placed_on_public_tier_only() {
        let env = env(1);
        assert!(create_external_balancer(&env.fabric, "edge", "Public").is_ok());
        assert!(matches!(
            create_external_balancer(&env.fabric, "edge", "Private"),
            Err(BalancerError::Configuration(_))
        ));
    }

    #[test]
    fn passes_connections_through_to_tls_listener() {
        let mut env = env(1);
        let mut alb = balancer(&mut env);
        let https = alb.listener(443).unwrap().handle(&alb.dns_name);

        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        nlb.add_tcp_listener(443, &https, edge_health()).unwrap();
        nlb.activate();
        assert_eq!(nlb.forward(443).unwrap(), &https);

        let request = Request::get("/").body(()).unwrap();
        assert_eq!(
            nlb.handle(443, &request, &alb).unwrap().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let target = alb.target_groups()[0].targets[0].id.clone();
        alb.set_target_health("tg-app", &target, TargetHealthState::Healthy, None)
            .unwrap();
        let response = nlb.handle(443, &request, &alb).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[TARGET_HEADER], target.as_str());
    }

    #[test]
    fn target_must_be_tls_listener() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let http = alb.listener(80).unwrap().handle(&alb.dns_name);
        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        assert!(nlb.add_tcp_listener(443, &http, edge_health()).is_err());
    }

    #[test]
    fn health_check_must_probe_forwarding_port() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let https = alb.listener(443).unwrap().handle(&alb.dns_name);
        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        let mut hc = edge_health();
        hc.port = HealthCheckPort::Port(8443);
        assert!(matches!(
            nlb.add_tcp_listener(443, &https, hc),
            Err(BalancerError::PortMismatch { expected: 443, found: 8443, .. })
        ));
    }

    #[test]
    fn listener_state_follows_target_health() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let https = alb.listener(443).unwrap().handle(&alb.dns_name);
        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        nlb.add_tcp_listener(443, &https, edge_health()).unwrap();
        assert_eq!(nlb.listener(443).unwrap().state, ListenerState::Created);
        nlb.activate();

        let tg = nlb.target_groups()[0].id.clone();
        nlb.set_target_health(&tg, &https.listener, TargetHealthState::Healthy, None)
            .unwrap();
        assert_eq!(nlb.listener(443).unwrap().state, ListenerState::Healthy);
        nlb.set_target_health(&tg, &https.listener, TargetHealthState::Unhealthy, None)
            .unwrap();
        assert_eq!(nlb.listener(443).unwrap().state, ListenerState::Unhealthy);
    }
}
