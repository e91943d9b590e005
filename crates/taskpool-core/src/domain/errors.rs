//! Error taxonomy of the pool.
//!
//! Every error carries an [`ErrorKind`] telling the caller how to react:
//! retry later, drop the token and re-acquire, or treat it as a bug.
//! A duplicate result submission is not an error at all; see
//! [`crate::domain::SubmitAck::AlreadyFinalized`].

use thiserror::Error;

use super::ids::{LeaseToken, NodeId, TaskId};
use super::state::TaskState;

/// Operational classification of a [`PoolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected under load or contention; the caller retries with backoff.
    Transient,
    /// The presented lease is dead; the caller must re-acquire.
    Reacquire,
    /// The referenced entity does not exist.
    NotFound,
    /// The request is well-formed but refused in the current state.
    Rejected,
    /// Ordering or programming error. Logged loudly, never surfaced as a crash.
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("queue full: depth reached capacity {capacity}")]
    QueueFull { capacity: usize },

    #[error("task {0} is not available for leasing")]
    TaskNotAvailable(TaskId),

    #[error("lease {0} expired or is no longer live")]
    LeaseExpired(LeaseToken),

    #[error("invalid transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("node {0} cannot take new leases")]
    NodeUnavailable(NodeId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("result store unavailable: {0}")]
    StorageUnavailable(String),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::QueueFull { .. }
            | PoolError::TaskNotAvailable(_)
            | PoolError::StorageUnavailable(_) => ErrorKind::Transient,
            PoolError::LeaseExpired(_) => ErrorKind::Reacquire,
            PoolError::UnknownNode(_) | PoolError::UnknownTask(_) => ErrorKind::NotFound,
            PoolError::NodeUnavailable(_) | PoolError::InvalidConfig(_) => ErrorKind::Rejected,
            PoolError::InvalidTransition { .. } => ErrorKind::Structural,
        }
    }

    /// Stable machine-readable name, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::UnknownNode(_) => "UnknownNode",
            PoolError::UnknownTask(_) => "UnknownTask",
            PoolError::QueueFull { .. } => "QueueFull",
            PoolError::TaskNotAvailable(_) => "TaskNotAvailable",
            PoolError::LeaseExpired(_) => "LeaseExpired",
            PoolError::InvalidTransition { .. } => "InvalidTransition",
            PoolError::NodeUnavailable(_) => "NodeUnavailable",
            PoolError::InvalidConfig(_) => "InvalidConfig",
            PoolError::StorageUnavailable(_) => "StorageUnavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[rstest]
    #[case::queue_full(PoolError::QueueFull { capacity: 1 }, ErrorKind::Transient)]
    #[case::lost_race(PoolError::TaskNotAvailable(task()), ErrorKind::Transient)]
    #[case::unknown_node(PoolError::UnknownNode(NodeId::new("n1")), ErrorKind::NotFound)]
    #[case::transition(
        PoolError::InvalidTransition { task_id: task(), from: TaskState::Completed, to: TaskState::Completed },
        ErrorKind::Structural
    )]
    fn errors_are_classified(#[case] err: PoolError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn messages_name_the_entity() {
        let err = PoolError::UnknownNode(NodeId::new("gpu-7"));
        assert_eq!(err.to_string(), "unknown node: gpu-7");
        assert_eq!(err.code(), "UnknownNode");
    }
}
