//! Status views served by `/nodes` and `/stats`.
//!
//! Field names follow the dashboard's existing client (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NodeId, NodeRecord, NodeStatus};
use crate::queue::QueueCounts;

/// One row of `GET /nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Seconds since the node last came online; zero while Offline.
    pub uptime: u64,
    pub papers_processed: u64,
    pub tokens_per_hour: f64,
    pub last_seen: DateTime<Utc>,
}

impl NodeView {
    pub fn from_record(node: &NodeRecord, now: DateTime<Utc>) -> Self {
        let uptime = match node.status {
            NodeStatus::Offline => 0,
            NodeStatus::Online | NodeStatus::Draining => {
                u64::try_from((now - node.online_since).num_seconds()).unwrap_or(0)
            }
        };
        // At least one minute so a fresh node does not report a spike.
        let hours = (now - node.registered_at).num_seconds().max(60) as f64 / 3600.0;
        Self {
            id: node.id.clone(),
            status: node.status,
            uptime,
            papers_processed: node.tasks_completed,
            tokens_per_hour: node.reward_units / hours,
            last_seen: node.last_heartbeat,
        }
    }
}

/// `GET /stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active_nodes: usize,
    pub papers_processed: usize,
    pub tokens_earned: f64,
    pub queue_depth: usize,
    pub pending: usize,
    pub leased: usize,
    /// Leases held; one that ran out counts until the next sweep ends it.
    pub live_leases: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    /// completed / (completed + abandoned); zero before anything finished.
    pub completion_rate: f64,
}

impl PoolStats {
    pub fn collect(counts: QueueCounts, nodes: &[NodeRecord]) -> Self {
        let settled = counts.completed + counts.abandoned;
        let completion_rate = if settled == 0 {
            0.0
        } else {
            counts.completed as f64 / settled as f64
        };
        Self {
            active_nodes: nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Online)
                .count(),
            papers_processed: counts.completed,
            tokens_earned: nodes.iter().map(|n| n.reward_units).sum(),
            queue_depth: counts.live(),
            pending: counts.pending,
            leased: counts.leased,
            live_leases: counts.leased,
            abandoned: counts.abandoned,
            cancelled: counts.cancelled,
            completion_rate,
        }
    }
}
