//! Target groups: the backends a listener forwards to, with their health.

use std::net::SocketAddrV4;

use edgechain_core::{HealthCheckSpec, Protocol};
use edgechain_state::TargetHealthState;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BalancerError, BalancerResult};
use crate::listener::ListenerHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Task addresses.
    Ip,
    /// A listener on another balancer.
    Listener,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// `ip:port` for address targets, the listener id for listener targets.
    pub id: String,
    pub port: u16,
    pub health: TargetHealthState,
    pub reason: Option<String>,
    /// Present on listener targets.
    pub listener: Option<ListenerHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    /// Port targets are registered on.
    pub port: u16,
    pub kind: TargetKind,
    pub health_check: HealthCheckSpec,
    pub targets: Vec<Target>,
}

impl TargetGroup {
    pub fn new(
        name: &str,
        protocol: Protocol,
        port: u16,
        kind: TargetKind,
        health_check: HealthCheckSpec,
    ) -> BalancerResult<Self> {
        if port == 0 {
            return Err(BalancerError::configuration(format!("target group {name}: port 0")));
        }
        health_check
            .validate()
            .map_err(|e| BalancerError::configuration(format!("target group {name}: {e}")))?;
        Ok(Self {
            id: format!("tg-{name}"),
            name: name.to_string(),
            protocol,
            port,
            kind,
            health_check,
            targets: Vec::new(),
        })
    }

    /// Register task addresses. Every target must use the group's port.
    pub fn register_addresses(&mut self, targets: &[SocketAddrV4]) -> BalancerResult<()> {
        if self.kind != TargetKind::Ip {
            return Err(BalancerError::configuration(format!(
                "{} takes listener targets, not addresses",
                self.name
            )));
        }
        for addr in targets {
            self.check_port(addr.port())?;
        }
        for addr in targets {
            self.insert(Target {
                id: addr.to_string(),
                port: addr.port(),
                health: TargetHealthState::Initial,
                reason: None,
                listener: None,
            });
        }
        Ok(())
    }

    pub fn register_listener(&mut self, handle: &ListenerHandle) -> BalancerResult<()> {
        if self.kind != TargetKind::Listener {
            return Err(BalancerError::configuration(format!(
                "{} takes address targets, not listeners",
                self.name
            )));
        }
        self.check_port(handle.port)?;
        self.insert(Target {
            id: handle.listener.clone(),
            port: handle.port,
            health: TargetHealthState::Initial,
            reason: None,
            listener: Some(handle.clone()),
        });
        Ok(())
    }

    fn check_port(&self, port: u16) -> BalancerResult<()> {
        if port != self.port {
            return Err(BalancerError::PortMismatch {
                tier: self.name.clone(),
                expected: self.port,
                found: port,
            });
        }
        Ok(())
    }

    fn insert(&mut self, target: Target) {
        if !self.targets.iter().any(|t| t.id == target.id) {
            debug!(target_group = %self.name, target = %target.id, "target registered");
            self.targets.push(target);
        }
    }

    pub fn deregister(&mut self, target: &str) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.id != target);
        before != self.targets.len()
    }

    /// Record a health transition. Returns false for unknown targets.
    pub fn set_health(&mut self, target: &str, health: TargetHealthState, reason: Option<String>) -> bool {
        match self.targets.iter_mut().find(|t| t.id == target) {
            Some(t) => {
                t.health = health;
                t.reason = reason;
                true
            }
            None => false,
        }
    }

    pub fn healthy(&self) -> impl Iterator<Item = &Target> {
        self.targets
            .iter()
            .filter(|t| t.health == TargetHealthState::Healthy)
    }

    pub fn states(&self) -> Vec<TargetHealthState> {
        self.targets.iter().map(|t| t.health).collect()
    }

    /// Port the health check probes for a target.
    pub fn probe_port(&self, target: &Target) -> u16 {
        self.health_check.port.resolve(target.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn group() -> TargetGroup {
        TargetGroup::new("app", Protocol::Http, 3000, TargetKind::Ip, HealthCheckSpec::default()).unwrap()
    }

    #[test]
    fn registers_addresses_on_group_port() {
        let mut tg = group();
        tg.register_addresses(&[SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 20), 3000)])
            .unwrap();
        assert_eq!(tg.targets[0].id, "10.0.2.20:3000");
        assert_eq!(tg.targets[0].health, TargetHealthState::Initial);
        assert_eq!(tg.probe_port(&tg.targets[0]), 3000);
    }

    #[test]
    fn rejects_port_mismatch() {
        let mut tg = group();
        let err = tg
            .register_addresses(&[SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 20), 8080)])
            .unwrap_err();
        assert!(matches!(
            err,
            BalancerError::PortMismatch {
                expected: 3000,
                found: 8080,
                ..
            }
        ));
        assert!(tg.targets.is_empty());
    }

    #[test]
    fn health_updates_and_healthy_filter() {
        let mut tg = group();
        tg.register_addresses(&[
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 20), 3000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 3, 20), 3000),
        ])
        .unwrap();
        assert!(tg.set_health("10.0.2.20:3000", TargetHealthState::Healthy, None));
        assert!(!tg.set_health("10.9.9.9:3000", TargetHealthState::Healthy, None));
        assert_eq!(tg.healthy().count(), 1);

        assert!(tg.deregister("10.0.2.20:3000"));
        assert_eq!(tg.healthy().count(), 0);
    }

    #[test]
    fn invalid_health_check_rejected() {
        let mut hc = HealthCheckSpec::default();
        hc.healthy_threshold = 1;
        assert!(TargetGroup::new("app", Protocol::Http, 3000, TargetKind::Ip, hc).is_err());
    }
}
