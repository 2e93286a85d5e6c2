//! Services: replica-managed copies of a task definition.
//!
//! `launch_service` lays out the desired number of tasks across the zone
//! subnets of an isolated tier. Keeping that many tasks running afterwards
//! is the platform's job; the service only records the target.

use std::net::SocketAddrV4;

use edgechain_core::Visibility;
use edgechain_network::{Fabric, GroupHandle, ReachabilityPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::error::{ComputeError, ComputeResult};
use crate::rotation::RoundRobin;
use crate::task::TaskDefinition;

/// Task addresses start at this host offset within each subnet.
const TASK_HOST_BASE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub replicas: u32,
    pub tier: String,
    pub group: GroupHandle,
}

/// One running copy of the task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub subnet: String,
    pub zone: String,
    pub address: std::net::Ipv4Addr,
}

/// Binding of one container port of the service to a balancer target group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRegistration {
    pub target_group: String,
    pub container_name: String,
    pub container_port: u16,
    pub targets: Vec<SocketAddrV4>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub cluster: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub tier: String,
    pub group: GroupHandle,
    /// Always false; isolated tiers have nowhere to route a public address.
    pub assign_public_ip: bool,
    pub tasks: Vec<Task>,
    pub registrations: Vec<TargetRegistration>,
}

pub fn launch_service(
    fabric: &Fabric,
    policy: &ReachabilityPolicy,
    cluster: &Cluster,
    task: &TaskDefinition,
    spec: &ServiceSpec,
) -> ComputeResult<Service> {
    if cluster.fabric != fabric.id {
        return Err(ComputeError::InvalidService(format!(
            "cluster {} belongs to another fabric",
            cluster.id
        )));
    }
    if spec.name.is_empty() {
        return Err(ComputeError::InvalidService("service name must not be empty".into()));
    }
    let tier = fabric.tier(&spec.tier)?;
    if tier.visibility == Visibility::Public {
        return Err(ComputeError::PublicPlacement(spec.tier.clone()));
    }
    let group = policy.group(spec.group)?;
    if let Some(bound) = &group.tier
        && bound != &spec.tier
    {
        return Err(ComputeError::InvalidService(format!(
            "group {} is bound to tier {bound}, service runs in {}",
            group.name, spec.tier
        )));
    }

    let subnets = fabric.tier_subnets(&spec.tier)?;
    let rotation = RoundRobin::new();
    let mut per_subnet = vec![0u32; subnets.len()];
    let mut tasks = Vec::with_capacity(spec.replicas as usize);
    for n in 0..spec.replicas {
        let Some(i) = rotation.next(subnets.len()) else {
            break;
        };
        let subnet = subnets[i];
        let address = subnet.host(TASK_HOST_BASE + per_subnet[i]).ok_or_else(|| {
            ComputeError::InvalidService(format!("{} has no room for task {n}", subnet.cidr))
        })?;
        per_subnet[i] += 1;
        tasks.push(Task {
            id: format!("task-{}-{n}", spec.name),
            subnet: subnet.id.clone(),
            zone: subnet.zone.clone(),
            address,
        });
    }

    let service = Service {
        id: format!("{}/{}", cluster.id, spec.name),
        name: spec.name.clone(),
        cluster: cluster.id.clone(),
        task_definition: task.id(),
        desired_count: spec.replicas,
        tier: spec.tier.clone(),
        group: spec.group,
        assign_public_ip: false,
        tasks,
        registrations: Vec::new(),
    };
    info!(
        service = %service.id,
        task = %service.task_definition,
        desired = service.desired_count,
        tier = %service.tier,
        "service launched"
    );
    Ok(service)
}

impl Service {
    /// Register `container_name:container_port` of every task with a target
    /// group. The port must be one the container actually maps; a mismatch
    /// would otherwise surface only as dropped traffic.
    pub fn register_targets(
        &mut self,
        task: &TaskDefinition,
        container_name: &str,
        container_port: u16,
        target_group: &str,
    ) -> ComputeResult<TargetRegistration> {
        if task.id() != self.task_definition {
            return Err(ComputeError::InvalidService(format!(
                "service {} runs {}, not {}",
                self.name,
                self.task_definition,
                task.id()
            )));
        }
        let container = task.container(container_name)?;
        if !container.maps_port(container_port) {
            return Err(ComputeError::UnmappedPort {
                container: container_name.to_string(),
                port: container_port,
            });
        }
        if self.registrations.iter().any(|r| r.target_group == target_group) {
            return Err(ComputeError::DuplicateRegistration(target_group.to_string()));
        }
        let registration = TargetRegistration {
            target_group: target_group.to_string(),
            container_name: container_name.to_string(),
            container_port,
            targets: self
                .tasks
                .iter()
                .map(|t| SocketAddrV4::new(t.address, container_port))
                .collect(),
        };
        debug!(
            service = %self.name,
            target_group,
            container = container_name,
            port = container_port,
            targets = registration.targets.len(),
            "targets registered"
        );
        self.registrations.push(registration.clone());
        Ok(registration)
    }
}
