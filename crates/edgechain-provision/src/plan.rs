//! Diff between desired resources and what the state store has on record.

use std::collections::{HashMap, HashSet};
use std::fmt;

use edgechain_state::{ResourceKey, ResourceRecord};
use serde::{Deserialize, Serialize};

use crate::resource::{DesiredResource, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    /// Recorded with different attributes or a different physical id.
    Replace,
    /// On record but no longer desired.
    Delete,
    NoOp,
}

impl Action {
    fn symbol(self) -> char {
        match self {
            Action::Create => '+',
            Action::Replace => '~',
            Action::Delete => '-',
            Action::NoOp => '=',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: ResourceKey,
    /// Producing step. Deletions have none: the resource is no longer built.
    pub step: Option<Step>,
    pub action: Action,
    pub physical_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub changes: Vec<Change>,
}

impl Plan {
    /// True when applying would not touch the platform.
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == Action::NoOp)
    }

    pub fn count(&self, action: Action) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    pub fn action(&self, key: &ResourceKey) -> Option<Action> {
        self.changes.iter().find(|c| &c.key == key).map(|c| c.action)
    }

    /// Changes that touch the platform, in apply order.
    pub fn pending(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(|c| c.action != Action::NoOp)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in self.pending() {
            let step = change.step.map(Step::as_str).unwrap_or("-");
            writeln!(f, "{} {:<18} {}", change.action.symbol(), step, change.key)?;
        }
        write!(
            f,
            "{} to create, {} to replace, {} to delete, {} unchanged",
            self.count(Action::Create),
            self.count(Action::Replace),
            self.count(Action::Delete),
            self.count(Action::NoOp),
        )
    }
}

/// Action needed to bring `record` in line with `resource`.
pub(crate) fn action_for(resource: &DesiredResource, record: Option<&ResourceRecord>) -> Action {
    match record {
        None => Action::Create,
        Some(record) if record.fingerprint != resource.fingerprint || record.physical_id != resource.physical_id => {
            Action::Replace
        }
        Some(_) => Action::NoOp,
    }
}

/// Compare `desired` (in build order) against `observed`. Desired changes
/// keep their order; deletions follow, newest record first.
pub fn diff(desired: &[DesiredResource], observed: &[ResourceRecord]) -> Plan {
    let recorded: HashMap<&ResourceKey, &ResourceRecord> = observed.iter().map(|r| (&r.key, r)).collect();
    let mut changes = Vec::with_capacity(desired.len());

    for resource in desired {
        let action = action_for(resource, recorded.get(&resource.key).copied());
        changes.push(Change {
            key: resource.key.clone(),
            step: Some(resource.step),
            action,
            physical_id: resource.physical_id.clone(),
        });
    }

    let wanted: HashSet<&ResourceKey> = desired.iter().map(|r| &r.key).collect();
    let mut stale: Vec<&ResourceRecord> = observed.iter().filter(|r| !wanted.contains(&r.key)).collect();
    stale.sort_by(|a, b| b.sequence.cmp(&a.sequence));
    changes.extend(stale.into_iter().map(|record| Change {
        key: record.key.clone(),
        step: None,
        action: Action::Delete,
        physical_id: record.physical_id.clone(),
    }));

    Plan { changes }
}
