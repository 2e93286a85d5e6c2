//! Internal application-layer balancer.
//!
//! Terminates TLS with a single bound certificate and forwards plain HTTP to
//! the service's target group. Its plain-HTTP listener does nothing but
//! redirect to the TLS listener.

use std::net::Ipv4Addr;

use edgechain_compute::{RoundRobin, Service, TaskDefinition};
use edgechain_core::{Direction, HealthCheckSpec, Layer, Protocol, Scheme};
use edgechain_network::{Fabric, GroupHandle, ReachabilityPolicy};
use edgechain_state::TargetHealthState;
use http::{HeaderValue, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::TARGET_HEADER;
use crate::certificate::{CertificateRef, CertificateStore};
use crate::error::{BalancerError, BalancerResult};
use crate::listener::{Listener, ListenerAction, ListenerHandle, ListenerState, RedirectAction};
use crate::target_group::{TargetGroup, TargetKind};

/// Balancer node addresses use the first usable host of each subnet.
pub(crate) const BALANCER_HOST: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationBalancer {
    pub id: String,
    pub name: String,
    pub scheme: Scheme,
    pub layer: Layer,
    pub tier: String,
    pub group: GroupHandle,
    pub dns_name: String,
    /// One node per zone.
    pub addresses: Vec<Ipv4Addr>,
    listeners: Vec<Listener>,
    target_groups: Vec<TargetGroup>,
    #[serde(skip)]
    rotation: RoundRobin,
}

pub fn create_internal_balancer(
    fabric: &Fabric,
    policy: &ReachabilityPolicy,
    name: &str,
    tier: &str,
    group: GroupHandle,
) -> BalancerResult<ApplicationBalancer> {
    let subnets = fabric.tier_subnets(tier)?;
    let sg = policy.group(group)?;
    if let Some(bound) = &sg.tier
        && bound != tier
    {
        return Err(BalancerError::configuration(format!(
            "group {} is bound to tier {bound}, balancer is in {tier}",
            sg.name
        )));
    }
    let addresses = subnets
        .iter()
        .map(|s| {
            s.host(BALANCER_HOST)
                .ok_or_else(|| BalancerError::configuration(format!("{} has no usable hosts", s.cidr)))
        })
        .collect::<BalancerResult<Vec<_>>>()?;

    let hash = short_hash(&[&fabric.id, name, tier]);
    let balancer = ApplicationBalancer {
        id: format!("alb-{name}-{hash}"),
        name: name.to_string(),
        scheme: Scheme::Internal,
        layer: Layer::Application,
        tier: tier.to_string(),
        group,
        dns_name: format!("internal-{name}-{hash}.{}.elb.amazonaws.com", fabric.region),
        addresses,
        listeners: Vec::new(),
        target_groups: Vec::new(),
        rotation: RoundRobin::new(),
    };
    info!(balancer = %balancer.id, tier, "internal balancer created");
    Ok(balancer)
}

pub(crate) fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())[..8].to_string()
}

impl ApplicationBalancer {
    /// Target group of task addresses, registered on `port`.
    pub fn create_target_group(
        &mut self,
        name: &str,
        port: u16,
        health_check: HealthCheckSpec,
    ) -> BalancerResult<String> {
        if self.target_groups.iter().any(|tg| tg.name == name) {
            return Err(BalancerError::configuration(format!("target group {name} already exists")));
        }
        let tg = TargetGroup::new(name, Protocol::Http, port, TargetKind::Ip, health_check)?;
        let id = tg.id.clone();
        self.target_groups.push(tg);
        Ok(id)
    }

    /// Plain-HTTP listener whose only action is a permanent redirect to
    /// HTTPS on `https_port`.
    pub fn add_redirect_listener(
        &mut self,
        policy: &mut ReachabilityPolicy,
        port: u16,
        https_port: u16,
    ) -> BalancerResult<ListenerHandle> {
        self.check_free(port)?;
        policy.allow_cidr(self.group, policy.fabric_cidr(), Protocol::Tcp, port)?;
        let handle = self.push_listener(
            Protocol::Http,
            port,
            None,
            ListenerAction::Redirect(RedirectAction::to_https(https_port)),
        );
        Ok(handle)
    }

    /// TLS listener bound to exactly one certificate, forwarding to
    /// `target_group`. The certificate is resolved through `store` first; an
    /// unresolvable reference leaves no listener behind.
    pub fn add_tls_listener(
        &mut self,
        policy: &mut ReachabilityPolicy,
        port: u16,
        certificate: &CertificateRef,
        store: &dyn CertificateStore,
        target_group: &str,
    ) -> BalancerResult<ListenerHandle> {
        self.check_free(port)?;
        self.target_group(target_group)?;
        let resolved = store.resolve(certificate)?;
        policy.allow_cidr(self.group, policy.fabric_cidr(), Protocol::Tcp, port)?;
        debug!(certificate = %resolved.reference, port, "certificate bound");
        let handle = self.push_listener(
            Protocol::Https,
            port,
            Some(resolved.reference),
            ListenerAction::Forward {
                target_group: target_group.to_string(),
            },
        );
        Ok(handle)
    }

    fn check_free(&self, port: u16) -> BalancerResult<()> {
        if self.listeners.iter().any(|l| l.port == port) {
            return Err(BalancerError::DuplicateListener(port));
        }
        Ok(())
    }

    fn push_listener(
        &mut self,
        protocol: Protocol,
        port: u16,
        certificate: Option<CertificateRef>,
        action: ListenerAction,
    ) -> ListenerHandle {
        let listener = Listener {
            id: format!("{}/listener/{port}", self.id),
            balancer: self.id.clone(),
            protocol,
            port,
            certificate,
            action,
            state: ListenerState::Created,
        };
        info!(listener = %listener.id, %protocol, port, "listener created");
        let handle = listener.handle(&self.dns_name);
        self.listeners.push(listener);
        handle
    }

    /// Register the service's container port with a target group and open
    /// the path from this balancer to the service's group.
    pub fn register_service(
        &mut self,
        policy: &mut ReachabilityPolicy,
        service: &mut Service,
        task: &TaskDefinition,
        container_name: &str,
        container_port: u16,
        target_group: &str,
    ) -> BalancerResult<()> {
        let group = self.group;
        let tg = self.target_group_mut(target_group)?;
        if tg.port != container_port {
            return Err(BalancerError::PortMismatch {
                tier: format!("target group {}", tg.name),
                expected: container_port,
                found: tg.port,
            });
        }
        let probe_port = tg.health_check.port.resolve(container_port);
        let registration = service.register_targets(task, container_name, container_port, target_group)?;
        tg.register_addresses(&registration.targets)?;

        policy.allow(group, service.group, Protocol::Tcp, container_port, Direction::Ingress)?;
        if probe_port != container_port {
            policy.allow(group, service.group, Protocol::Tcp, probe_port, Direction::Ingress)?;
        }
        info!(
            service = %service.name,
            target_group,
            port = container_port,
            "service registered with internal balancer"
        );
        Ok(())
    }

    /// Move every `Created` listener to `Listening`.
    pub fn activate(&mut self) {
        for listener in &mut self.listeners {
            if listener.state == ListenerState::Created {
                listener.state = ListenerState::Listening;
            }
        }
    }

    /// Answer a request arriving on `port`.
    pub fn handle<B>(&self, port: u16, request: &Request<B>) -> BalancerResult<Response<()>> {
        let listener = self.listener(port)?;
        if listener.state == ListenerState::Created {
            return Err(BalancerError::UnknownListener(port));
        }
        match &listener.action {
            ListenerAction::Redirect(redirect) => Ok(redirect.apply(request)),
            ListenerAction::Forward { target_group } => {
                let tg = self.target_group(target_group)?;
                let healthy: Vec<_> = tg.healthy().collect();
                let mut response = Response::new(());
                match self.rotation.next(healthy.len()) {
                    Some(i) => {
                        if let Ok(value) = HeaderValue::from_str(&healthy[i].id) {
                            response.headers_mut().insert(TARGET_HEADER, value);
                        }
                    }
                    None => {
                        warn!(target_group = %tg.name, "no healthy targets");
                        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    }
                }
                Ok(response)
            }
        }
    }

    /// Record a target health transition and refresh listener states.
    pub fn set_target_health(
        &mut self,
        target_group: &str,
        target: &str,
        health: TargetHealthState,
        reason: Option<String>,
    ) -> BalancerResult<bool> {
        let changed = self.target_group_mut(target_group)?.set_health(target, health, reason);
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

    fn target_group_mut(&mut self, id: &str) -> BalancerResult<&mut TargetGroup> {
        self.target_groups
            .iter_mut()
            .find(|tg| tg.id == id)
            .ok_or_else(|| BalancerError::UnknownTargetGroup(id.to_string()))
    }

    pub fn target_groups(&self) -> &[TargetGroup] {
        &self.target_groups
    }

    /// Whether the TLS listener on `port` has at least one healthy target.
    pub fn is_serving(&self, port: u16) -> bool {
        self.listener(port).is_ok_and(|l| l.state.is_serving())
    }
}

/// Recompute forwarding listeners' states from their target groups.
pub(crate) fn refresh_listeners(listeners: &mut [Listener], target_groups: &[TargetGroup]) {
    for listener in listeners {
        if listener.state == ListenerState::Created {
            continue;
        }
        let Some(tg) = listener
            .target_group()
            .and_then(|id| target_groups.iter().find(|tg| tg.id == id))
        else {
            continue;
        };
        let next = ListenerState::from_targets(&tg.states());
        if next != listener.state {
            info!(listener = %listener.id, from = ?listener.state, to = ?next, "listener state changed");
            listener.state = next;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::certificate::StaticCertificateStore;
    use edgechain_compute::{ContainerDefinition, ServiceSpec, create_cluster, launch_service};
    use edgechain_core::{ImageRef, Visibility};
    use edgechain_network::{FabricSpec, Peer, TierSpec, create_fabric};
    use http::header;

    pub(crate) struct Env {
        pub fabric: Fabric,
        pub policy: ReachabilityPolicy,
        pub service: Service,
        pub task: TaskDefinition,
        pub alb_sg: GroupHandle,
        pub store: StaticCertificateStore,
    }

    pub(crate) fn env(replicas: u32) -> Env {
        let tier = |name: &str, visibility| TierSpec {
            name: name.to_string(),
            cidr_mask: 24,
            visibility,
            zones: None,
        };
        let fabric = create_fabric(&FabricSpec {
            name: "app".to_string(),
            region: "ca-central-1".to_string(),
            cidr: "10.0.0.0/16".parse().unwrap(),
            zones: vec!["a".to_string(), "b".to_string()],
            tiers: vec![tier("Public", Visibility::Public), tier("Private", Visibility::Isolated)],
        })
        .unwrap();
        let mut policy = ReachabilityPolicy::new(&fabric);
        let compute = policy.declare_group("compute", Some("Private")).unwrap();
        let alb_sg = policy.declare_group("balancer", Some("Private")).unwrap();
        let cluster = create_cluster(&fabric, "app");
        let container =
            ContainerDefinition::new("appContainer", ImageRef::parse("app:1.0").unwrap()).with_port(3000);
        let task = TaskDefinition::new("app", 256, 512, vec![container]).unwrap();
        let service = launch_service(
            &fabric,
            &policy,
            &cluster,
            &task,
            &ServiceSpec {
                name: "fin-chat".to_string(),
                replicas,
                tier: "Private".to_string(),
                group: compute,
            },
        )
        .unwrap();
        let store = StaticCertificateStore::new();
        store.insert("cert-1");
        Env {
            fabric,
            policy,
            service,
            task,
            alb_sg,
            store,
        }
    }

    pub(crate) fn balancer(env: &mut Env) -> ApplicationBalancer {
        let mut alb = create_internal_balancer(&env.fabric, &env.policy, "app", "Private", env.alb_sg).unwrap();
        let tg = alb.create_target_group("app", 3000, HealthCheckSpec::default()).unwrap();
        alb.register_service(&mut env.policy, &mut env.service, &env.task, "appContainer", 3000, &tg)
            .unwrap();
        alb.add_redirect_listener(&mut env.policy, 80, 443).unwrap();
        alb.add_tls_listener(&mut env.policy, 443, &CertificateRef::new("cert-1"), &env.store, &tg)
            .unwrap();
        alb.activate();
        alb
    }

    fn get(uri: &str) -> Request<()> {
        Request::get(uri).header(header::HOST, "app.internal").body(()).unwrap()
    }

    #[test]
    fn http_listener_redirects() {
        let mut env = env(1);
        let alb = balancer(&mut env);
        let response = alb.handle(80, &get("/any/path?x=1")).unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://app.internal/any/path?x=1");
    }

    #[test]
    fn tls_listener_needs_healthy_target() {
        let mut env = env(2);
        let mut alb = balancer(&mut env);
        assert_eq!(alb.handle(443, &get("/")).unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(alb.listener(443).unwrap().state, ListenerState::Listening);

        let target = alb.target_groups()[0].targets[0].id.clone();
        alb.set_target_health("tg-app", &target, TargetHealthState::Healthy, None)
            .unwrap();
        let response = alb.handle(443, &get("/")).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[TARGET_HEADER], target.as_str());
        assert_eq!(alb.listener(443).unwrap().state, ListenerState::Degraded);
        // The redirect listener has no targets.
        assert_eq!(alb.listener(80).unwrap().state, ListenerState::Listening);
    }

    #[test]
    fn requests_rotate_over_healthy_targets() {
        let mut env = env(2);
        let mut alb = balancer(&mut env);
        let ids: Vec<_> = alb.target_groups()[0].targets.iter().map(|t| t.id.clone()).collect();
        for id in &ids {
            alb.set_target_health("tg-app", id, TargetHealthState::Healthy, None)
                .unwrap();
        }
        let served: Vec<_> = (0..4)
            .map(|_| {
                alb.handle(443, &get("/")).unwrap().headers()[TARGET_HEADER]
                    .to_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(served, vec![ids[0].clone(), ids[1].clone(), ids[0].clone(), ids[1].clone()]);
        assert_eq!(alb.listener(443).unwrap().state, ListenerState::Healthy);
    }

    #[test]
    fn unknown_certificate_leaves_no_listener() {
        let mut env = env(1);
        let mut alb = create_internal_balancer(&env.fabric, &env.policy, "app", "Private", env.alb_sg).unwrap();
        let tg = alb.create_target_group("app", 3000, HealthCheckSpec::default()).unwrap();
        let err = alb
            .add_tls_listener(&mut env.policy, 443, &CertificateRef::new("missing"), &env.store, &tg)
            .unwrap_err();
        assert!(matches!(err, BalancerError::Certificate(_)));
        assert!(alb.listeners().is_empty());
    }

    #[test]
    fn registration_opens_balancer_to_service_only() {
        let mut env = env(1);
        let _alb = balancer(&mut env);
        let compute = env.service.group;
        assert!(env.policy.permits(env.alb_sg, compute, Protocol::Tcp, 3000));
        assert!(env.policy.check_least_privilege(compute, env.alb_sg).is_ok());
        // Listener ports admit the fabric range, nothing else.
        assert!(
            env.policy
                .ingress_rules(env.alb_sg)
                .all(|r| r.peer == Peer::Cidr(env.fabric.cidr))
        );
    }

    #[test]
    fn target_group_port_must_match_container_port() {
        let mut env = env(1);
        let mut alb = create_internal_balancer(&env.fabric, &env.policy, "app", "Private", env.alb_sg).unwrap();
        let tg = alb.create_target_group("app", 443, HealthCheckSpec::default()).unwrap();
        let err = alb
            .register_service(&mut env.policy, &mut env.service, &env.task, "appContainer", 3000, &tg)
            .unwrap_err();
        assert!(matches!(err, BalancerError::PortMismatch { expected: 3000, found: 443, .. }));
    }

    #[test]
    fn duplicate_listener_port_rejected() {
        let mut env = env(1);
        let mut alb = balancer(&mut env);
        assert!(matches!(
            alb.add_redirect_listener(&mut env.policy, 80, 443),
            Err(BalancerError::DuplicateListener(80))
        ));
    }
}
