//! Task and node states.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Leased -> Completed
/// - Leased -> Pending (expiry, node loss, failure while attempts remain)
/// - Leased -> Failed -> Pending (failure with a retry delay configured)
/// - Leased -> Abandoned (attempts exhausted)
/// - Pending | Leased | Failed -> Cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a node.
    Pending,

    /// Held by exactly one node under a live lease.
    Leased,

    /// Finished with an accepted success result.
    Completed,

    /// Last attempt failed; waiting for the retry delay to elapse.
    Failed,

    /// Gave up after exhausting attempts.
    Abandoned,

    /// Withdrawn by the submitter. Kept for audit.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Abandoned | TaskState::Cancelled
        )
    }

    /// Counted against queue capacity.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

/// Node liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    /// Finishing current leases, accepting no new ones.
    Draining,
}
