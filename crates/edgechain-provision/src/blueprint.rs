//! Staged construction of an environment from its stack config.
//!
//! Each stage builds the domain objects for one [`Step`] on top of the
//! previous stages and returns the resources that realize them. Building is
//! pure: nothing here talks to the platform, so `plan` and `apply` walk the
//! same stages and always agree on what the environment should contain.

use edgechain_balancer::{
    ApplicationBalancer, CertificateRef, CertificateStore, NetworkBalancer, PortChain, create_external_balancer,
    create_internal_balancer, verify_port_chain,
};
use edgechain_compute::{
    Cluster, ContainerDefinition, Service, ServiceSpec, TaskDefinition, create_cluster, launch_service,
};
use edgechain_core::{Direction, ImageRef, Protocol, StackConfig, Visibility};
use edgechain_network::{
    Caller, EndpointFabric, EndpointRequest, Fabric, FabricSpec, GroupHandle, Peer, ReachabilityError,
    ReachabilityPolicy, Rule, attach_endpoint, create_fabric,
};
use edgechain_state::{ResourceKind, ResourceRecord};
use serde_json::json;
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};
use crate::resource::{DesiredResource, Step, fingerprint};

/// Security groups every environment declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Groups {
    pub endpoints: GroupHandle,
    pub compute: GroupHandle,
    pub balancer: GroupHandle,
}

/// Everything a fully built environment consists of.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub fabric: Fabric,
    pub policy: ReachabilityPolicy,
    pub groups: Groups,
    pub endpoints: EndpointFabric,
    pub cluster: Cluster,
    pub task: TaskDefinition,
    pub service: Service,
    pub internal: ApplicationBalancer,
    pub external: NetworkBalancer,
    pub port_chain: PortChain,
}

impl Deployment {
    /// Image reference, external address, and external port.
    pub fn outputs(&self) -> Vec<(String, String)> {
        let image = self
            .task
            .containers()
            .first()
            .map(|c| c.image.as_str().to_string())
            .unwrap_or_default();
        vec![
            ("image-uri".to_string(), image),
            ("external-address".to_string(), self.external.dns_name.clone()),
            ("external-port".to_string(), self.port_chain.external_port.to_string()),
        ]
    }

    /// Open every control-plane connection a task needs, from every task's
    /// subnet. Failures are collected, not returned early.
    pub fn verify_reachability(&self) -> Vec<ReachabilityError> {
        let mut failures = Vec::new();
        for task in &self.service.tasks {
            let caller = Caller {
                group: self.service.group,
                subnet: &task.subnet,
            };
            for result in [
                self.endpoints.verify_image_pull(&self.fabric, &self.policy, &caller),
                self.endpoints.verify_telemetry(&self.fabric, &self.policy, &caller),
            ] {
                if let Err(e) = result
                    && !failures.contains(&e)
                {
                    failures.push(e);
                }
            }
        }
        failures
    }
}

pub struct Blueprint {
    config: StackConfig,
    fabric: Option<Fabric>,
    policy: Option<ReachabilityPolicy>,
    groups: Option<Groups>,
    endpoints: Option<EndpointFabric>,
    cluster: Option<Cluster>,
    task: Option<TaskDefinition>,
    service: Option<Service>,
    internal: Option<ApplicationBalancer>,
    external: Option<NetworkBalancer>,
    port_chain: Option<PortChain>,
    /// Policy rules already handed out as resources.
    emitted_rules: usize,
}

fn out_of_order(step: Step) -> ProvisionError {
    ProvisionError::OutOfOrder(step)
}

impl Blueprint {
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            fabric: None,
            policy: None,
            groups: None,
            endpoints: None,
            cluster: None,
            task: None,
            service: None,
            internal: None,
            external: None,
            port_chain: None,
            emitted_rules: 0,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn fabric(&mut self) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::Fabric;
        let spec = FabricSpec::from_config(&self.config.stack.name, &self.config.stack.region, &self.config.network);
        let fabric = create_fabric(&spec)?;

        let mut resources = vec![DesiredResource::new(
            step,
            ResourceKind::Fabric,
            &fabric.name,
            &fabric.id,
            json!({
                "region": fabric.region,
                "cidr": fabric.cidr,
                "zones": fabric.zones,
                "internet_gateway": fabric.internet_gateway,
            }),
        )?];
        for table in &fabric.route_tables {
            resources.push(DesiredResource::new(
                step,
                ResourceKind::RouteTable,
                format!("{}-{}", table.tier, table.zone),
                &table.id,
                json!({ "routes": table.routes }),
            )?);
        }
        for subnet in &fabric.subnets {
            resources.push(DesiredResource::new(
                step,
                ResourceKind::Subnet,
                format!("{}-{}", subnet.tier, subnet.zone),
                &subnet.id,
                json!({
                    "cidr": subnet.cidr,
                    "visibility": subnet.visibility,
                    "route_table": subnet.route_table,
                }),
            )?);
        }
        self.fabric = Some(fabric);
        Ok(resources)
    }

    /// Declare the endpoint, compute, and balancer groups and grant the
    /// configured callers access to the endpoints.
    pub fn policy(&mut self) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::Policy;
        let fabric = self.fabric.as_ref().ok_or_else(|| out_of_order(step))?;
        let endpoint_tier = fabric
            .tier_or_first(self.config.endpoints.tier.as_deref(), Visibility::Isolated)?
            .name
            .clone();
        let service_tier = fabric
            .tier_or_first(self.config.service.tier.as_deref(), Visibility::Isolated)?
            .name
            .clone();
        let balancer_tier = fabric
            .tier_or_first(self.config.balancer.tier.as_deref(), Visibility::Isolated)?
            .name
            .clone();

        let mut policy = ReachabilityPolicy::new(fabric);
        let groups = Groups {
            endpoints: policy.declare_group("endpoints", Some(&endpoint_tier))?,
            compute: policy.declare_group("compute", Some(&service_tier))?,
            balancer: policy.declare_group("balancer", Some(&balancer_tier))?,
        };
        for caller in &self.config.endpoints.allow_from {
            policy.allow_by_name(
                caller,
                "endpoints",
                Protocol::Tcp,
                self.config.endpoints.port,
                Direction::Ingress,
            )?;
        }
        policy.check_least_privilege(groups.endpoints, groups.compute)?;

        let mut resources = Vec::new();
        for (_, group) in policy.groups() {
            resources.push(DesiredResource::new(
                step,
                ResourceKind::SecurityGroup,
                &group.name,
                &group.id,
                json!({
                    "tier": group.tier,
                    "allow_all_outbound": group.allow_all_outbound,
                }),
            )?);
        }
        self.policy = Some(policy);
        self.groups = Some(groups);
        resources.extend(self.new_rules(step)?);
        Ok(resources)
    }

    /// Rules added to the policy since the last call.
    fn new_rules(&mut self, step: Step) -> ProvisionResult<Vec<DesiredResource>> {
        let policy = self.policy.as_ref().ok_or_else(|| out_of_order(step))?;
        let mut resources = Vec::new();
        for rule in &policy.rules()[self.emitted_rules..] {
            resources.push(rule_resource(policy, rule, step)?);
        }
        self.emitted_rules = policy.rules().len();
        Ok(resources)
    }

    pub fn endpoints(&mut self) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::Endpoints;
        let fabric = self.fabric.as_ref().ok_or_else(|| out_of_order(step))?;
        let policy = self.policy.as_ref().ok_or_else(|| out_of_order(step))?;
        let groups = self.groups.ok_or_else(|| out_of_order(step))?;
        let tier = policy.group(groups.endpoints)?.tier.clone().unwrap_or_default();

        let mut endpoints = EndpointFabric::new();
        let mut resources = Vec::new();
        for service in &self.config.endpoints.services {
            let request = EndpointRequest::for_service(*service, &tier, groups.endpoints, self.config.endpoints.port);
            let endpoint = attach_endpoint(fabric, policy, &request)?;
            let group = endpoint.group.map(|g| policy.group(g).map(|sg| sg.id.clone())).transpose()?;
            resources.push(DesiredResource::new(
                step,
                ResourceKind::Endpoint,
                service.as_str(),
                &endpoint.id,
                json!({
                    "kind": endpoint.kind,
                    "tier": endpoint.tier,
                    "group": group,
                    "private_dns": endpoint.private_dns,
                    "hostname": endpoint.hostname,
                    "port": endpoint.port,
                    "addresses": endpoint.addresses(),
                    "routes": endpoint.routes,
                }),
            )?);
            endpoints.insert(endpoint);
        }
        self.endpoints = Some(endpoints);
        Ok(resources)
    }

    /// Cluster, task definition, and service. `previous_task` is the task
    /// definition on record: an unchanged body keeps its revision, a changed
    /// one becomes the next revision.
    pub fn compute(&mut self, previous_task: Option<&ResourceRecord>) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::Compute;
        let fabric = self.fabric.as_ref().ok_or_else(|| out_of_order(step))?;
        let policy = self.policy.as_ref().ok_or_else(|| out_of_order(step))?;
        let groups = self.groups.ok_or_else(|| out_of_order(step))?;
        let svc = &self.config.service;

        let cluster = create_cluster(fabric, &self.config.stack.name);
        let image = ImageRef::parse(&svc.image).map_err(edgechain_compute::ComputeError::from)?;
        let container = ContainerDefinition::new(&svc.container_name, image)
            .with_port(svc.container_port)
            .with_env(svc.env.clone());
        let task = TaskDefinition::new(&svc.name, svc.cpu, svc.memory_mib, vec![container])?;

        let body = json!({
            "family": task.family(),
            "cpu": task.cpu(),
            "memory_mib": task.memory_mib(),
            "containers": task.containers(),
        });
        let body_fingerprint = fingerprint(&body);
        let revision = match previous_task {
            Some(record) => {
                let recorded = record
                    .attributes
                    .get("revision")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|r| u32::try_from(r).ok())
                    .unwrap_or(1);
                if record.fingerprint == body_fingerprint {
                    recorded
                } else {
                    recorded + 1
                }
            }
            None => 1,
        };
        let task = task.with_revision(revision);
        debug!(task = %task.id(), "task definition resolved");

        let tier = policy.group(groups.compute)?.tier.clone().unwrap_or_default();
        let service = launch_service(
            fabric,
            policy,
            &cluster,
            &task,
            &ServiceSpec {
                name: svc.name.clone(),
                replicas: svc.replicas,
                tier,
                group: groups.compute,
            },
        )?;

        let mut task_resource = DesiredResource::new(step, ResourceKind::TaskDefinition, task.family(), task.id(), body)?;
        task_resource.attributes["revision"] = json!(revision);

        let resources = vec![
            DesiredResource::new(
                step,
                ResourceKind::Cluster,
                &cluster.name,
                &cluster.id,
                json!({ "fabric": cluster.fabric }),
            )?,
            task_resource,
            DesiredResource::new(
                step,
                ResourceKind::Service,
                &service.name,
                &service.id,
                json!({
                    "cluster": service.cluster,
                    "task_definition": service.task_definition,
                    "desired_count": service.desired_count,
                    "tier": service.tier,
                    "group": policy.group(service.group)?.id,
                    "assign_public_ip": service.assign_public_ip,
                    "tasks": service.tasks,
                }),
            )?,
        ];
        self.cluster = Some(cluster);
        self.task = Some(task);
        self.service = Some(service);
        Ok(resources)
    }

    /// Internal balancer: target group, service registration, HTTP redirect
    /// listener, and the TLS listener. The certificate is resolved before
    /// anything is built, so an unusable reference fails the step cleanly.
    pub fn internal_balancer(&mut self, certificates: &dyn CertificateStore) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::InternalBalancer;
        let fabric = self.fabric.as_ref().ok_or_else(|| out_of_order(step))?;
        let policy = self.policy.as_mut().ok_or_else(|| out_of_order(step))?;
        let groups = self.groups.ok_or_else(|| out_of_order(step))?;
        let task = self.task.as_ref().ok_or_else(|| out_of_order(step))?;
        let service = self.service.as_mut().ok_or_else(|| out_of_order(step))?;
        let cfg = &self.config.balancer;
        let svc = &self.config.service;

        let certificate = CertificateRef::new(cfg.certificate.clone());
        certificates.resolve(&certificate).map_err(edgechain_balancer::BalancerError::from)?;

        let tier = policy.group(groups.balancer)?.tier.clone().unwrap_or_default();
        let mut alb = create_internal_balancer(fabric, policy, &self.config.stack.name, &tier, groups.balancer)?;
        let tg = alb.create_target_group(&svc.name, svc.container_port, self.config.internal_health()?)?;
        alb.register_service(policy, service, task, &svc.container_name, svc.container_port, &tg)?;
        alb.add_redirect_listener(policy, cfg.http_port, cfg.https_port)?;
        alb.add_tls_listener(policy, cfg.https_port, &certificate, certificates, &tg)?;
        alb.activate();

        let mut resources = vec![DesiredResource::new(
            step,
            ResourceKind::LoadBalancer,
            "internal",
            &alb.id,
            json!({
                "scheme": alb.scheme,
                "layer": alb.layer,
                "tier": alb.tier,
                "group": policy.group(alb.group)?.id,
                "dns_name": alb.dns_name,
                "addresses": alb.addresses,
            }),
        )?];
        for group in alb.target_groups() {
            resources.push(target_group_resource(step, group)?);
        }
        self.internal = Some(alb);
        resources.extend(self.new_rules(step)?);

        let alb = self.internal.as_ref().ok_or_else(|| out_of_order(step))?;
        for listener in alb.listeners() {
            let resource = DesiredResource::new(
                step,
                ResourceKind::Listener,
                format!("internal-{}", listener.port),
                &listener.id,
                json!({
                    "protocol": listener.protocol,
                    "port": listener.port,
                    "certificate": listener.certificate,
                    "action": listener.action,
                }),
            )?;
            // Binding a certificate is not safe to repeat blindly.
            resources.push(if listener.certificate.is_some() {
                resource.non_idempotent()
            } else {
                resource
            });
        }
        Ok(resources)
    }

    /// Internet-facing passthrough to the internal TLS listener, then the
    /// end-to-end port check.
    pub fn external_balancer(&mut self) -> ProvisionResult<Vec<DesiredResource>> {
        let step = Step::ExternalBalancer;
        let fabric = self.fabric.as_ref().ok_or_else(|| out_of_order(step))?;
        let alb = self.internal.as_ref().ok_or_else(|| out_of_order(step))?;
        let task = self.task.as_ref().ok_or_else(|| out_of_order(step))?;
        let service = self.service.as_ref().ok_or_else(|| out_of_order(step))?;
        let ext = &self.config.external;

        let tier = fabric.tier_or_first(ext.tier.as_deref(), Visibility::Public)?.name.clone();
        let https = alb.listener(self.config.balancer.https_port)?.handle(&alb.dns_name);
        let mut nlb = create_external_balancer(fabric, &self.config.stack.name, &tier)?;
        nlb.add_tcp_listener(ext.port, &https, self.config.external_health()?)?;
        nlb.activate();
        let chain = verify_port_chain(task, service, alb, &nlb, ext.port)?;

        let mut resources = vec![DesiredResource::new(
            step,
            ResourceKind::LoadBalancer,
            "external",
            &nlb.id,
            json!({
                "scheme": nlb.scheme,
                "layer": nlb.layer,
                "tier": nlb.tier,
                "dns_name": nlb.dns_name,
                "addresses": nlb.addresses,
            }),
        )?];
        for group in nlb.target_groups() {
            resources.push(target_group_resource(step, group)?);
        }
        for listener in nlb.listeners() {
            resources.push(DesiredResource::new(
                step,
                ResourceKind::Listener,
                format!("external-{}", listener.port),
                &listener.id,
                json!({
                    "protocol": listener.protocol,
                    "port": listener.port,
                    "action": listener.action,
                    "forwards_to": https.listener,
                }),
            )?);
        }
        self.external = Some(nlb);
        self.port_chain = Some(chain);
        Ok(resources)
    }

    /// Run the stages for `step`.
    pub fn stage(
        &mut self,
        step: Step,
        previous_task: Option<&ResourceRecord>,
        certificates: &dyn CertificateStore,
    ) -> ProvisionResult<Vec<DesiredResource>> {
        match step {
            Step::Fabric => self.fabric(),
            Step::Policy => self.policy(),
            Step::Endpoints => self.endpoints(),
            Step::Compute => self.compute(previous_task),
            Step::InternalBalancer => self.internal_balancer(certificates),
            Step::ExternalBalancer => self.external_balancer(),
        }
    }

    pub fn into_deployment(self) -> ProvisionResult<Deployment> {
        let incomplete = |step| ProvisionError::OutOfOrder(step);
        Ok(Deployment {
            fabric: self.fabric.ok_or_else(|| incomplete(Step::Fabric))?,
            policy: self.policy.ok_or_else(|| incomplete(Step::Policy))?,
            groups: self.groups.ok_or_else(|| incomplete(Step::Policy))?,
            endpoints: self.endpoints.ok_or_else(|| incomplete(Step::Endpoints))?,
            cluster: self.cluster.ok_or_else(|| incomplete(Step::Compute))?,
            task: self.task.ok_or_else(|| incomplete(Step::Compute))?,
            service: self.service.ok_or_else(|| incomplete(Step::Compute))?,
            internal: self.internal.ok_or_else(|| incomplete(Step::InternalBalancer))?,
            external: self.external.ok_or_else(|| incomplete(Step::ExternalBalancer))?,
            port_chain: self.port_chain.ok_or_else(|| incomplete(Step::ExternalBalancer))?,
        })
    }
}

fn rule_resource(policy: &ReachabilityPolicy, rule: &Rule, step: Step) -> ProvisionResult<DesiredResource> {
    let group = policy.group(rule.group)?;
    let peer = match rule.peer {
        Peer::Group(h) => policy.group(h)?.name.clone(),
        Peer::Cidr(net) => net.to_string(),
    };
    let direction = match rule.direction {
        Direction::Ingress => "in",
        Direction::Egress => "out",
    };
    let name = format!("{}-{direction}-{peer}-{}-{}", group.name, rule.protocol, rule.port);
    let physical_id = format!("sgr-{}", &fingerprint(&json!([group.id, name]))[..12]);
    DesiredResource::new(
        step,
        ResourceKind::SecurityGroupRule,
        name,
        physical_id,
        json!({
            "group": group.id,
            "direction": rule.direction,
            "peer": peer,
            "protocol": rule.protocol,
            "port": rule.port,
        }),
    )
}

fn target_group_resource(step: Step, group: &edgechain_balancer::TargetGroup) -> ProvisionResult<DesiredResource> {
    let targets: Vec<&str> = group.targets.iter().map(|t| t.id.as_str()).collect();
    DesiredResource::new(
        step,
        ResourceKind::TargetGroup,
        &group.name,
        &group.id,
        json!({
            "protocol": group.protocol,
            "port": group.port,
            "kind": group.kind,
            "health_check": group.health_check,
            "targets": targets,
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use edgechain_balancer::StaticCertificateStore;

    pub(crate) const CERT: &str =
        "arn:aws:acm:ca-central-1:111122223333:certificate/0b1f1c2e-4d5a-4f7e-9a3b-7c6d5e4f3a2b";

    pub(crate) fn config() -> StackConfig {
        StackConfig::scaffold("fin-chat", "ca-central-1", "registry.local/fin-chat:v1", CERT)
    }

    fn certificates() -> StaticCertificateStore {
        let store = StaticCertificateStore::new();
        store.insert(CERT);
        store
    }

    fn build(config: StackConfig) -> (Vec<DesiredResource>, Deployment) {
        let store = certificates();
        let mut blueprint = Blueprint::new(config);
        let mut all = Vec::new();
        for step in Step::ORDER {
            all.extend(blueprint.stage(step, None, &store).unwrap());
        }
        (all, blueprint.into_deployment().unwrap())
    }

    #[test]
    fn builds_every_step_in_order() {
        let (resources, deployment) = build(config());
        let steps: Vec<Step> = resources.iter().map(|r| r.step).collect();
        let mut sorted = steps.clone();
        sorted.sort();
        assert_eq!(steps, sorted);

        let count = |kind| resources.iter().filter(|r| r.key.kind == kind).count();
        assert_eq!(count(ResourceKind::Fabric), 1);
        assert_eq!(count(ResourceKind::Subnet), 4);
        assert_eq!(count(ResourceKind::SecurityGroup), 3);
        assert_eq!(count(ResourceKind::Endpoint), 5);
        assert_eq!(count(ResourceKind::LoadBalancer), 2);
        assert_eq!(count(ResourceKind::Listener), 3);

        assert_eq!(deployment.port_chain.container_port, 3000);
        assert_eq!(deployment.port_chain.internal_port, 443);
        assert!(deployment.verify_reachability().is_empty());
    }

    #[test]
    fn identical_input_builds_identical_resources() {
        let (a, _) = build(config());
        let (b, _) = build(config());
        let fingerprints = |rs: &[DesiredResource]| {
            rs.iter()
                .map(|r| (r.key.clone(), r.physical_id.clone(), r.fingerprint.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(fingerprints(&a), fingerprints(&b));
    }

    #[test]
    fn only_tls_listener_is_non_idempotent() {
        let (resources, _) = build(config());
        let non_idempotent: Vec<_> = resources.iter().filter(|r| !r.idempotent).map(|r| r.key.name.as_str()).collect();
        assert_eq!(non_idempotent, vec!["internal-443"]);
    }

    #[test]
    fn outputs_name_image_and_edge() {
        let (_, deployment) = build(config());
        let outputs = deployment.outputs();
        assert_eq!(outputs[0], ("image-uri".to_string(), "registry.local/fin-chat:v1".to_string()));
        assert_eq!(outputs[1].1, deployment.external.dns_name);
        assert_eq!(outputs[2], ("external-port".to_string(), "443".to_string()));
    }

    #[test]
    fn endpoint_grant_admits_only_compute() {
        let mut config = config();
        config.endpoints.allow_from = vec!["balancer".to_string()];
        let mut blueprint = Blueprint::new(config);
        blueprint.fabric().unwrap();
        let err = blueprint.policy().unwrap_err();
        assert!(matches!(err, ProvisionError::Network(edgechain_network::NetworkError::LeastPrivilege(_))));
    }

    #[test]
    fn missing_grant_is_found_at_runtime() {
        let mut config = config();
        config.endpoints.allow_from.clear();
        let (_, deployment) = build(config);
        let failures = deployment.verify_reachability();
        assert!(!failures.is_empty());
        assert!(
            failures
                .iter()
                .all(|f| matches!(f, ReachabilityError::ConnectionRefused { port: 443, .. }))
        );
    }

    #[test]
    fn changed_image_bumps_task_revision() {
        let store = certificates();
        let mut first = Blueprint::new(config());
        first.fabric().unwrap();
        first.policy().unwrap();
        let resources = first.compute(None).unwrap();
        let task = resources.iter().find(|r| r.key.kind == ResourceKind::TaskDefinition).unwrap();
        let record = ResourceRecord {
            env: "prod".to_string(),
            key: task.key.clone(),
            physical_id: task.physical_id.clone(),
            fingerprint: task.fingerprint.clone(),
            attributes: task.attributes.clone(),
            sequence: 1,
            run_id: "run-1".to_string(),
            created_at: 0,
        };

        let mut same = Blueprint::new(config());
        same.stage(Step::Fabric, None, &store).unwrap();
        same.stage(Step::Policy, None, &store).unwrap();
        let again = same.compute(Some(&record)).unwrap();
        assert!(again.iter().any(|r| r.physical_id == "fin-chat:1"));

        let mut changed = config();
        changed.service.image = "registry.local/fin-chat:v2".to_string();
        let mut next = Blueprint::new(changed);
        next.fabric().unwrap();
        next.policy().unwrap();
        let bumped = next.compute(Some(&record)).unwrap();
        assert!(bumped.iter().any(|r| r.physical_id == "fin-chat:2"));
    }

    #[test]
    fn stages_need_their_predecessors() {
        let mut blueprint = Blueprint::new(config());
        assert!(matches!(blueprint.endpoints(), Err(ProvisionError::OutOfOrder(Step::Endpoints))));
    }
}
