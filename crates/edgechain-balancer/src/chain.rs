//! End-to-end port mapping across the balancer chain.
//!
//! A port mismatch anywhere between the edge and the container is accepted
//! by every individual component and only shows up as dropped traffic, so
//! the whole chain is checked as one property after it is built.

use edgechain_compute::{ComputeError, Service, TaskDefinition};
use edgechain_core::Protocol;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::ApplicationBalancer;
use crate::error::{BalancerError, BalancerResult};
use crate::network::NetworkBalancer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChain {
    pub external_port: u16,
    pub internal_port: u16,
    pub container_port: u16,
}

fn mismatch(tier: &str, expected: u16, found: u16) -> BalancerResult<()> {
    if expected != found {
        return Err(BalancerError::PortMismatch {
            tier: tier.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Walk `external:port → internal TLS listener → target group → container`
/// and check every hop agrees on the port it hands traffic to.
pub fn verify_port_chain(
    task: &TaskDefinition,
    service: &Service,
    internal: &ApplicationBalancer,
    external: &NetworkBalancer,
    external_port: u16,
) -> BalancerResult<PortChain> {
    let handle = external.forward(external_port)?;
    if handle.balancer != internal.id {
        return Err(BalancerError::configuration(format!(
            "external listener {external_port} targets {}, not {}",
            handle.balancer, internal.id
        )));
    }
    let edge_tg = external
        .listener(external_port)?
        .target_group()
        .ok_or_else(|| BalancerError::configuration("external listener does not forward"))?;
    let edge_tg = external.target_group(edge_tg)?;
    mismatch("external target group", handle.port, edge_tg.port)?;
    mismatch(
        "external health check",
        handle.port,
        edge_tg.health_check.port.resolve(edge_tg.port),
    )?;

    let tls = internal.listener(handle.port)?;
    if tls.protocol != Protocol::Https {
        return Err(BalancerError::configuration(format!(
            "external balancer forwards to {} listener on {}",
            tls.protocol, tls.port
        )));
    }
    let tg_id = tls
        .target_group()
        .ok_or_else(|| BalancerError::configuration("TLS listener does not forward"))?;
    let tg = internal.target_group(tg_id)?;

    let registration = service
        .registrations
        .iter()
        .find(|r| r.target_group == tg.id)
        .ok_or_else(|| BalancerError::configuration(format!("service {} is not registered with {}", service.name, tg.id)))?;
    let container = task.container(&registration.container_name)?;
    if !container.maps_port(registration.container_port) {
        return Err(BalancerError::Compute(ComputeError::UnmappedPort {
            container: container.name.clone(),
            port: registration.container_port,
        }));
    }
    mismatch("internal target group", registration.container_port, tg.port)?;
    for target in &tg.targets {
        mismatch(&format!("target {}", target.id), registration.container_port, target.port)?;
    }

    let chain = PortChain {
        external_port,
        internal_port: tls.port,
        container_port: registration.container_port,
    };
    debug!(?chain, "port chain verified");
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tests::{balancer, env};
    use crate::create_external_balancer;
    use edgechain_core::{HealthCheckPort, HealthCheckSpec};

    #[test]
    fn full_chain_agrees() {
        let mut env = env(2);
        let alb = balancer(&mut env);
        let https = alb.listener(443).unwrap().handle(&alb.dns_name);
        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        nlb.add_tcp_listener(
            443,
            &https,
            HealthCheckSpec {
                protocol: Protocol::Https,
                port: HealthCheckPort::Port(443),
                ..Default::default()
            },
        )
        .unwrap();
        nlb.activate();

        let chain = verify_port_chain(&env.task, &env.service, &alb, &nlb, 443).unwrap();
        assert_eq!(
            chain,
            PortChain {
                external_port: 443,
                internal_port: 443,
                container_port: 3000
            }
        );
        let mapped: Vec<_> = env.task.containers()[0]
            .port_mappings
            .iter()
            .map(|m| m.container_port)
            .collect();
        assert!(mapped.contains(&chain.container_port));
    }

    #[test]
    fn unknown_external_port() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        assert!(matches!(
            verify_port_chain(&env.task, &env.service, &alb, &nlb, 443),
            Err(BalancerError::UnknownListener(443))
        ));
    }

    #[test]
    fn unregistered_service_fails() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let https = alb.listener(443).unwrap().handle(&alb.dns_name);
        let mut nlb = create_external_balancer(&env.fabric, "edge", "Public").unwrap();
        nlb.add_tcp_listener(
            443,
            &https,
            HealthCheckSpec {
                protocol: Protocol::Https,
                port: HealthCheckPort::TrafficPort,
                ..Default::default()
            },
        )
        .unwrap();
        nlb.activate();

        let mut service = env.service.clone();
        service.registrations.clear();
        assert!(matches!(
            verify_port_chain(&env.task, &service, &alb, &nlb, 443),
            Err(BalancerError::Configuration(_))
        ));
    }
}
