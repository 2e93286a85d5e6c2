//! Reachability policy: security groups and the allow rules between them.
//!
//! Groups live in an arena owned by the policy and are referred to by
//! [`GroupHandle`]s. A handle can only be obtained by declaring the group,
//! so a rule can never reference a group that does not exist yet; the
//! declaration order is therefore a valid creation order.
//!
//! Evaluation is default-deny and stateful: a flow from group A to group B
//! is permitted when B has an ingress rule naming A and A may send to B
//! (either `allow_all_outbound` or an explicit egress rule). Return traffic
//! is implied.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use edgechain_core::{Direction, Protocol};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};
use crate::fabric::Fabric;

static NEXT_POLICY: AtomicU64 = AtomicU64::new(1);

/// Reference to a group declared in a specific policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupHandle {
    policy: u64,
    index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    /// Tier the group's members are placed in, when bound to one.
    pub tier: Option<String>,
    pub allow_all_outbound: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    Group(GroupHandle),
    Cidr(Ipv4Net),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// The group this rule is attached to.
    pub group: GroupHandle,
    pub peer: Peer,
    /// Always a transport protocol (TCP or UDP).
    pub protocol: Protocol,
    pub port: u16,
    pub direction: Direction,
}

impl Rule {
    fn matches(&self, protocol: Protocol, port: u16) -> bool {
        self.protocol == protocol.transport() && self.port == port
    }
}

#[derive(Debug, Clone)]
pub struct ReachabilityPolicy {
    id: u64,
    fabric_id: String,
    fabric_cidr: Ipv4Net,
    tiers: Vec<String>,
    groups: Vec<SecurityGroup>,
    rules: Vec<Rule>,
}

impl ReachabilityPolicy {
    pub fn new(fabric: &Fabric) -> Self {
        Self {
            id: NEXT_POLICY.fetch_add(1, Ordering::Relaxed),
            fabric_id: fabric.id.clone(),
            fabric_cidr: fabric.cidr,
            tiers: fabric.tiers.iter().map(|t| t.name.clone()).collect(),
            groups: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Declare a group, optionally bound to a subnet tier of the fabric.
    ///
    /// New groups may send anywhere (`allow_all_outbound`) and admit nothing.
    pub fn declare_group(&mut self, name: &str, tier: Option<&str>) -> NetworkResult<GroupHandle> {
        if self.groups.iter().any(|g| g.name == name) {
            return Err(NetworkError::DuplicateGroup(name.to_string()));
        }
        if let Some(tier) = tier
            && !self.tiers.iter().any(|t| t == tier)
        {
            return Err(NetworkError::UnknownTier(tier.to_string()));
        }
        let handle = GroupHandle {
            policy: self.id,
            index: self.groups.len(),
        };
        self.groups.push(SecurityGroup {
            id: format!("sg-{}-{}", &self.fabric_id[4..], name.to_ascii_lowercase()),
            name: name.to_string(),
            tier: tier.map(String::from),
            allow_all_outbound: true,
        });
        debug!(group = name, "security group declared");
        Ok(handle)
    }

    /// Drop the implicit allow-all egress; only explicit egress rules remain.
    pub fn restrict_outbound(&mut self, group: GroupHandle) -> NetworkResult<()> {
        self.check(group)?;
        self.groups[group.index].allow_all_outbound = false;
        Ok(())
    }

    /// Allow `protocol`/`port` between two declared groups.
    ///
    /// `Ingress` attaches the rule to `to` (admit from `from`); `Egress`
    /// attaches it to `from` (send to `to`).
    pub fn allow(
        &mut self,
        from: GroupHandle,
        to: GroupHandle,
        protocol: Protocol,
        port: u16,
        direction: Direction,
    ) -> NetworkResult<()> {
        self.check(from)?;
        self.check(to)?;
        let (group, peer) = match direction {
            Direction::Ingress => (to, Peer::Group(from)),
            Direction::Egress => (from, Peer::Group(to)),
        };
        self.push_rule(Rule {
            group,
            peer,
            protocol: protocol.transport(),
            port,
            direction,
        });
        Ok(())
    }

    /// Allow ingress from an address range (used for balancer listeners).
    pub fn allow_cidr(
        &mut self,
        to: GroupHandle,
        cidr: Ipv4Net,
        protocol: Protocol,
        port: u16,
    ) -> NetworkResult<()> {
        self.check(to)?;
        self.push_rule(Rule {
            group: to,
            peer: Peer::Cidr(cidr),
            protocol: protocol.transport(),
            port,
            direction: Direction::Ingress,
        });
        Ok(())
    }

    /// Same as [`allow`](Self::allow) but resolving groups by name. Names
    /// that are not declared yet are rejected.
    pub fn allow_by_name(
        &mut self,
        from: &str,
        to: &str,
        protocol: Protocol,
        port: u16,
        direction: Direction,
    ) -> NetworkResult<()> {
        let from = self
            .handle(from)
            .ok_or_else(|| NetworkError::UnknownGroup(from.to_string()))?;
        let to = self
            .handle(to)
            .ok_or_else(|| NetworkError::UnknownGroup(to.to_string()))?;
        self.allow(from, to, protocol, port, direction)
    }

    fn push_rule(&mut self, rule: Rule) {
        // Rules are a set; re-declaring one is a no-op.
        if !self.rules.contains(&rule) {
            debug!(
                group = %self.groups[rule.group.index].name,
                port = rule.port,
                direction = ?rule.direction,
                "rule added"
            );
            self.rules.push(rule);
        }
    }

    fn check(&self, handle: GroupHandle) -> NetworkResult<()> {
        if handle.policy != self.id || handle.index >= self.groups.len() {
            return Err(NetworkError::ForeignHandle);
        }
        Ok(())
    }

    pub fn contains(&self, handle: GroupHandle) -> bool {
        self.check(handle).is_ok()
    }

    pub fn handle(&self, name: &str) -> Option<GroupHandle> {
        self.groups.iter().position(|g| g.name == name).map(|index| GroupHandle {
            policy: self.id,
            index,
        })
    }

    pub fn group(&self, handle: GroupHandle) -> NetworkResult<&SecurityGroup> {
        self.check(handle)?;
        Ok(&self.groups[handle.index])
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupHandle, &SecurityGroup)> {
        let policy = self.id;
        self.groups
            .iter()
            .enumerate()
            .map(move |(index, g)| (GroupHandle { policy, index }, g))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn ingress_rules(&self, group: GroupHandle) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(move |r| r.group == group && r.direction == Direction::Ingress)
    }

    pub fn fabric_cidr(&self) -> Ipv4Net {
        self.fabric_cidr
    }

    /// Whether members of `from` can open `protocol`/`port` connections to members of `to`.
    pub fn permits(&self, from: GroupHandle, to: GroupHandle, protocol: Protocol, port: u16) -> bool {
        if !self.contains(from) || !self.contains(to) {
            return false;
        }
        let admitted = self
            .ingress_rules(to)
            .any(|r| r.peer == Peer::Group(from) && r.matches(protocol, port));
        admitted && self.may_send(from, Peer::Group(to), protocol, port)
    }

    /// Whether a connection from a bare address (no group) is admitted by `to`.
    pub fn permits_address(&self, source: Ipv4Addr, to: GroupHandle, protocol: Protocol, port: u16) -> bool {
        self.contains(to)
            && self.ingress_rules(to).any(|r| match r.peer {
                Peer::Cidr(net) => net.contains(&source) && r.matches(protocol, port),
                Peer::Group(_) => false,
            })
    }

    fn may_send(&self, from: GroupHandle, to: Peer, protocol: Protocol, port: u16) -> bool {
        self.groups[from.index].allow_all_outbound
            || self.rules.iter().any(|r| {
                r.group == from
                    && r.direction == Direction::Egress
                    && r.peer == to
                    && r.matches(protocol, port)
            })
    }

    /// Every ingress rule on `protected` must name `only` as its peer.
    pub fn check_least_privilege(&self, protected: GroupHandle, only: GroupHandle) -> NetworkResult<()> {
        let name = &self.group(protected)?.name;
        self.check(only)?;
        for rule in self.ingress_rules(protected) {
            if rule.peer != Peer::Group(only) {
                let peer = match rule.peer {
                    Peer::Group(h) => self.groups[h.index].name.clone(),
                    Peer::Cidr(net) => net.to_string(),
                };
                return Err(NetworkError::LeastPrivilege(format!(
                    "group {name} admits {peer} on {}/{}",
                    rule.protocol, rule.port
                )));
            }
        }
        Ok(())
    }
}
