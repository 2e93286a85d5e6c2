//! Task definitions.
//!
//! A task definition is immutable once built. Changing anything (image,
//! environment, sizing) is a new definition numbered with the next revision
//! of the family via [`TaskDefinition::with_revision`].

use std::collections::BTreeMap;

use edgechain_core::{ImageRef, Protocol};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ComputeError, ComputeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: ImageRef,
    pub port_mappings: Vec<PortMapping>,
    /// Passed to the container verbatim.
    pub environment: BTreeMap<String, String>,
    pub essential: bool,
}

impl ContainerDefinition {
    pub fn new(name: &str, image: ImageRef) -> Self {
        Self {
            name: name.to_string(),
            image,
            port_mappings: Vec::new(),
            environment: BTreeMap::new(),
            essential: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port_mappings.push(PortMapping {
            container_port: port,
            protocol: Protocol::Tcp,
        });
        self
    }

    pub fn with_env(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn maps_port(&self, port: u16) -> bool {
        self.port_mappings.iter().any(|m| m.container_port == port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    family: String,
    revision: u32,
    cpu: u32,
    memory_mib: u32,
    containers: Vec<ContainerDefinition>,
}

impl TaskDefinition {
    /// Revision 1 of a new family.
    pub fn new(
        family: &str,
        cpu: u32,
        memory_mib: u32,
        containers: Vec<ContainerDefinition>,
    ) -> ComputeResult<Self> {
        let def = Self {
            family: family.to_string(),
            revision: 1,
            cpu,
            memory_mib,
            containers,
        };
        def.validate()?;
        debug!(task = %def.id(), "task definition registered");
        Ok(def)
    }

    /// Same body, numbered as a revision the platform already assigned.
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision.max(1);
        self
    }

    fn validate(&self) -> ComputeResult<()> {
        if self.family.is_empty() {
            return Err(ComputeError::InvalidTask("family must not be empty".into()));
        }
        if self.containers.is_empty() {
            return Err(ComputeError::InvalidTask(format!("{}: no containers", self.family)));
        }
        if !self.containers.iter().any(|c| c.essential) {
            return Err(ComputeError::InvalidTask(format!(
                "{}: at least one container must be essential",
                self.family
            )));
        }
        for (i, c) in self.containers.iter().enumerate() {
            if c.name.is_empty() {
                return Err(ComputeError::InvalidTask("container name must not be empty".into()));
            }
            if self.containers[..i].iter().any(|other| other.name == c.name) {
                return Err(ComputeError::InvalidTask(format!("duplicate container {}", c.name)));
            }
            if c.port_mappings.iter().any(|m| m.container_port == 0) {
                return Err(ComputeError::InvalidTask(format!("{}: port 0 is not mappable", c.name)));
            }
        }
        // Containers share the task network namespace.
        let mut ports: Vec<u16> = self
            .containers
            .iter()
            .flat_map(|c| c.port_mappings.iter().map(|m| m.container_port))
            .collect();
        let total = ports.len();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != total {
            return Err(ComputeError::InvalidTask(format!(
                "{}: two containers map the same port",
                self.family
            )));
        }
        validate_sizing(self.cpu, self.memory_mib)
    }

    /// `family:revision`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.family, self.revision)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    pub fn containers(&self) -> &[ContainerDefinition] {
        &self.containers
    }

    pub fn container(&self, name: &str) -> ComputeResult<&ContainerDefinition> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ComputeError::UnknownContainer(name.to_string()))
    }
}

/// CPU units and memory must form a combination the serverless platform
/// offers.
pub fn validate_sizing(cpu: u32, memory_mib: u32) -> ComputeResult<()> {
    let valid = match cpu {
        256 => matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory_mib) && memory_mib % 1024 == 0,
        1024 => (2048..=8192).contains(&memory_mib) && memory_mib % 1024 == 0,
        2048 => (4096..=16384).contains(&memory_mib) && memory_mib % 1024 == 0,
        4096 => (8192..=30720).contains(&memory_mib) && memory_mib % 1024 == 0,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ComputeError::InvalidSizing { cpu, memory_mib })
    }
}
