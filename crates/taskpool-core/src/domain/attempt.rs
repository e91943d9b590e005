//! Attempt history for audit and reward attribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum AttemptEnd {
    /// Success result accepted.
    Completed,

    /// Node reported a failure.
    Failed(String),

    /// Lease ran out without a result.
    Expired,

    /// Holder went silent past the heartbeat timeout.
    NodeLost,

    /// Push dispatch could not reach the node.
    Undelivered,

    /// Submitter cancelled the task while it was leased.
    Cancelled,
}

impl AttemptEnd {
    /// Short label used in logs and `last_error`.
    pub fn describe(&self) -> String {
        match self {
            AttemptEnd::Completed => "completed".to_string(),
            AttemptEnd::Failed(reason) => format!("failed: {reason}"),
            AttemptEnd::Expired => "lease expired".to_string(),
            AttemptEnd::NodeLost => "node lost".to_string(),
            AttemptEnd::Undelivered => "dispatch undelivered".to_string(),
            AttemptEnd::Cancelled => "cancelled".to_string(),
        }
    }
}

/// One lease of a task, from grant to end.
///
/// Records are never removed, so the node that did the work stays
/// attributable after the task is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub node_id: NodeId,
    pub issued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<AttemptEnd>,
}

impl AttemptRecord {
    pub fn open(attempt: u32, node_id: NodeId, issued_at: DateTime<Utc>) -> Self {
        Self {
            attempt,
            node_id,
            issued_at,
            ended_at: None,
            end: None,
        }
    }

    pub fn close(&mut self, end: AttemptEnd, at: DateTime<Utc>) {
        self.end = Some(end);
        self.ended_at = Some(at);
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}
