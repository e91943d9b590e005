//! Outcome model: what a node reports for one attempt.
//!
//! The pool never looks inside a success payload. It is handed to the result
//! store as-is.

use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// Result of executing one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Failure {
        reason: String,
    },
}

impl Outcome {
    pub fn success(payload: serde_json::Value) -> Self {
        Outcome::Success { payload }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Acknowledgement for a result submission.
///
/// A stale or duplicate submission is acknowledged, not rejected, because a
/// node may resend a result it is unsure was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum SubmitAck {
    /// The result was applied; `state` is the task's state afterwards.
    Accepted { state: TaskState },

    /// The token no longer names the task's live attempt. Nothing changed.
    AlreadyFinalized,
}
