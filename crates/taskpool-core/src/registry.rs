//! Node registry: known computing nodes, their capabilities and liveness.
//!
//! Nodes are never removed. A silent node is marked Offline and the caller
//! (the lease manager) releases whatever it was holding.
//!
//! Locking: a node entry may be locked while a task entry is held, never the
//! other way round. Nothing in this module touches tasks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::domain::{NodeCapabilities, NodeId, NodeRecord, NodeStatus, PoolError, TaskId};
use crate::ports::Clock;
use crate::ports::clock::cutoff;

/// A node that may be offered work right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleNode {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub free_slots: usize,
}

/// A node the liveness sweep just took offline, with the tasks it held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostNode {
    pub id: NodeId,
    pub held: Vec<TaskId>,
}

pub struct NodeRegistry {
    nodes: DashMap<NodeId, NodeRecord>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(clock: Arc<dyn Clock>, heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: DashMap::new(),
            clock,
            heartbeat_timeout,
        }
    }

    /// Idempotent. Re-registering updates capabilities and sets Online.
    pub fn register(&self, node_id: NodeId, capabilities: NodeCapabilities) -> NodeRecord {
        let now = self.clock.now();
        let mut entry = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| {
                info!(node_id = %node_id, "node registered");
                NodeRecord::new(node_id.clone(), capabilities.clone(), now)
            });
        entry.capabilities = capabilities;
        entry.mark_online(now);
        entry.clone()
    }

    /// Refreshes `last_heartbeat`. An Offline node comes back Online;
    /// a Draining node stays Draining.
    pub fn heartbeat(&self, node_id: &NodeId) -> Result<NodeStatus, PoolError> {
        let now = self.clock.now();
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::UnknownNode(node_id.clone()))?;
        match node.status {
            NodeStatus::Offline => {
                info!(node_id = %node_id, "node back online");
                node.mark_online(now);
            }
            NodeStatus::Online | NodeStatus::Draining => node.last_heartbeat = now,
        }
        Ok(node.status)
    }

    /// Stop offering new work; current leases run to completion.
    pub fn drain(&self, node_id: &NodeId) -> Result<(), PoolError> {
        let now = self.clock.now();
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::UnknownNode(node_id.clone()))?;
        node.status = NodeStatus::Draining;
        node.last_heartbeat = now;
        info!(node_id = %node_id, active = node.active_lease_count(), "node draining");
        Ok(())
    }

    /// Online nodes carrying every required tag and holding a free slot.
    pub fn eligible_nodes(&self, required: &BTreeSet<String>) -> Vec<NodeId> {
        self.eligible(required).into_iter().map(|n| n.id).collect()
    }

    /// Like `eligible_nodes`, with the detail the scheduler needs.
    /// Most free slots first, then by id, so dispatch order is stable.
    pub fn eligible(&self, required: &BTreeSet<String>) -> Vec<EligibleNode> {
        let mut out: Vec<EligibleNode> = self
            .nodes
            .iter()
            .filter(|n| n.can_accept() && n.capabilities.satisfies(required))
            .map(|n| EligibleNode {
                id: n.id.clone(),
                capabilities: n.capabilities.clone(),
                free_slots: n.capabilities.capacity() - n.active_lease_count(),
            })
            .collect();
        out.sort_by(|a, b| b.free_slots.cmp(&a.free_slots).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Marks every node silent for longer than the heartbeat timeout as
    /// Offline and returns what each one held.
    pub fn sweep_silent(&self) -> Vec<LostNode> {
        let deadline = cutoff(self.clock.now(), self.heartbeat_timeout);
        let mut lost = Vec::new();
        for mut node in self.nodes.iter_mut() {
            if !node.is_silent_since(deadline) {
                continue;
            }
            node.status = NodeStatus::Offline;
            let held: Vec<TaskId> = node.active_leases.iter().copied().collect();
            warn!(
                node_id = %node.id,
                last_heartbeat = %node.last_heartbeat,
                held = held.len(),
                "node missed heartbeat deadline, marking offline"
            );
            lost.push(LostNode {
                id: node.id.clone(),
                held,
            });
        }
        lost
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn online_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Online)
            .count()
    }

    /// Credits a verified completion.
    pub fn credit(&self, node_id: &NodeId, reward: f64) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.tasks_completed += 1;
            node.reward_units += reward;
        }
    }

    pub fn record_failure(&self, node_id: &NodeId) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.tasks_failed += 1;
        }
    }

    /// Takes one lease slot on the node. Called with the task entry held.
    pub(crate) fn reserve_slot(&self, node_id: &NodeId, task_id: TaskId) -> Result<(), PoolError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::UnknownNode(node_id.clone()))?;
        if !node.can_accept() {
            return Err(PoolError::NodeUnavailable(node_id.clone()));
        }
        node.active_leases.insert(task_id);
        Ok(())
    }

    /// Gives the slot back. Called with the task entry held.
    pub(crate) fn release_slot(&self, node_id: &NodeId, task_id: TaskId) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if !node.active_leases.remove(&task_id) {
                debug!(node_id = %node_id, task_id = %task_id, "slot already released");
            }
        }
    }
}
