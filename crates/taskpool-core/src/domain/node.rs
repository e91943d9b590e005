//! Computing node model.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{NodeId, TaskId};
use super::state::NodeStatus;

/// What a node says it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// How many leases the node may hold at once.
    #[serde(default = "default_batch_size")]
    pub max_batch_size: u32,
}

fn default_batch_size() -> u32 {
    1
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            tags: BTreeSet::new(),
            max_batch_size: default_batch_size(),
        }
    }
}

impl NodeCapabilities {
    pub fn new(max_batch_size: u32) -> Self {
        Self {
            tags: BTreeSet::new(),
            max_batch_size,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn capacity(&self) -> usize {
        self.max_batch_size.max(1) as usize
    }

    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }
}

/// Registry entry for one node. Never removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub online_since: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,

    /// Tasks this node currently holds a live lease on.
    pub active_leases: HashSet<TaskId>,

    pub tasks_completed: u64,
    pub tasks_failed: u64,

    /// Contribution credit, settled by the external ledger.
    pub reward_units: f64,
}

impl NodeRecord {
    pub fn new(id: NodeId, capabilities: NodeCapabilities, now: DateTime<Utc>) -> Self {
        Self {
            id,
            capabilities,
            status: NodeStatus::Online,
            registered_at: now,
            online_since: now,
            last_heartbeat: now,
            active_leases: HashSet::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            reward_units: 0.0,
        }
    }

    pub fn active_lease_count(&self) -> usize {
        self.active_leases.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_lease_count() < self.capabilities.capacity()
    }

    /// Online with a free slot.
    pub fn can_accept(&self) -> bool {
        self.status == NodeStatus::Online && self.has_capacity()
    }

    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        if self.status == NodeStatus::Offline {
            self.online_since = now;
        }
        self.status = NodeStatus::Online;
        self.last_heartbeat = now;
    }

    pub fn is_silent_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.status != NodeStatus::Offline && self.last_heartbeat < cutoff
    }
}
