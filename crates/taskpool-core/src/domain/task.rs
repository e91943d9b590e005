//! Task record: the single source of truth for one task.
//!
//! Every state change goes through a method here. Each method checks the
//! transition table first and is a no-op returning `InvalidTransition` when
//! the move is not allowed.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AttemptEnd, AttemptRecord};
use super::errors::PoolError;
use super::ids::{LeaseNonce, LeaseToken, NodeId, TaskId};
use super::lease::{Lease, LeaseGrant};
use super::state::TaskState;

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Opaque reference to the paper / job data.
    pub payload_ref: String,

    #[serde(default)]
    pub priority: u32,

    /// Tags a node must carry to run this task (e.g. "gpu").
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    /// Overrides the pool-wide attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskSubmission {
    pub fn new(payload_ref: impl Into<String>, priority: u32) -> Self {
        Self {
            payload_ref: payload_ref.into(),
            priority,
            required_capabilities: BTreeSet::new(),
            max_attempts: None,
        }
    }

    pub fn requires(mut self, tag: impl Into<String>) -> Self {
        self.required_capabilities.insert(tag.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

fn allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Pending, Leased)
            | (Pending, Cancelled)
            | (Leased, Completed)
            | (Leased, Pending)
            | (Leased, Failed)
            | (Leased, Abandoned)
            | (Leased, Cancelled)
            | (Failed, Pending)
            | (Failed, Cancelled)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub payload_ref: String,
    pub priority: u32,
    pub required_capabilities: BTreeSet<String>,
    pub state: TaskState,

    /// Number of leases ever issued for this task.
    pub attempt_count: u32,
    pub max_attempts: u32,

    /// The live lease; `Some` exactly while `state == Leased`.
    pub lease: Option<Lease>,

    pub last_error: Option<String>,

    /// When a Failed task becomes Pending again.
    pub next_run_at: Option<DateTime<Utc>>,

    pub attempts: Vec<AttemptRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Submission order; FIFO tie-break within a priority.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        submission: TaskSubmission,
        default_max_attempts: u32,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload_ref: submission.payload_ref,
            priority: submission.priority,
            required_capabilities: submission.required_capabilities,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: submission.max_attempts.unwrap_or(default_max_attempts).max(1),
            lease: None,
            last_error: None,
            next_run_at: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
            seq,
        }
    }

    fn check(&self, to: TaskState) -> Result<(), PoolError> {
        if allowed(self.state, to) {
            Ok(())
        } else {
            Err(PoolError::InvalidTransition {
                task_id: self.id,
                from: self.state,
                to,
            })
        }
    }

    fn set_state(&mut self, to: TaskState, now: DateTime<Utc>) {
        self.state = to;
        self.updated_at = now;
    }

    /// Ends the open attempt (if any) and drops the lease.
    fn close_attempt(&mut self, end: AttemptEnd, now: DateTime<Utc>) {
        self.lease = None;
        if let Some(last) = self.attempts.last_mut()
            && last.is_open()
        {
            last.close(end, now);
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// The lease, if `token` names it and it has not run out.
    pub fn live_lease(&self, token: &LeaseToken, now: DateTime<Utc>) -> Option<&Lease> {
        if self.state != TaskState::Leased {
            return None;
        }
        self.lease
            .as_ref()
            .filter(|lease| lease.token == *token && lease.is_live(now))
    }

    /// Pending -> Leased. Starts a new attempt and returns its lease.
    pub fn mark_leased(
        &mut self,
        node_id: NodeId,
        nonce: LeaseNonce,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, PoolError> {
        self.check(TaskState::Leased)?;
        self.attempt_count += 1;
        let token = LeaseToken {
            task_id: self.id,
            attempt: self.attempt_count,
            nonce,
        };
        let lease = Lease::new(token, node_id.clone(), now, ttl);
        self.attempts
            .push(AttemptRecord::open(self.attempt_count, node_id, now));
        self.lease = Some(lease.clone());
        self.set_state(TaskState::Leased, now);
        Ok(lease)
    }

    /// Leased -> Completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), PoolError> {
        self.check(TaskState::Completed)?;
        self.close_attempt(AttemptEnd::Completed, now);
        self.last_error = None;
        self.set_state(TaskState::Completed, now);
        Ok(())
    }

    /// Leased -> Pending (attempt ended) or Failed -> Pending (delay elapsed).
    pub fn requeue(&mut self, end: Option<AttemptEnd>, now: DateTime<Utc>) -> Result<(), PoolError> {
        self.check(TaskState::Pending)?;
        if let Some(end) = end {
            self.last_error = Some(end.describe());
            self.close_attempt(end, now);
        }
        self.next_run_at = None;
        self.set_state(TaskState::Pending, now);
        Ok(())
    }

    /// Leased -> Failed, to be retried at `next_run_at`.
    pub fn schedule_retry(
        &mut self,
        end: AttemptEnd,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        self.check(TaskState::Failed)?;
        self.last_error = Some(end.describe());
        self.close_attempt(end, now);
        self.next_run_at = Some(next_run_at);
        self.set_state(TaskState::Failed, now);
        Ok(())
    }

    /// Leased -> Abandoned.
    pub fn mark_abandoned(&mut self, end: AttemptEnd, now: DateTime<Utc>) -> Result<(), PoolError> {
        self.check(TaskState::Abandoned)?;
        self.last_error = Some(end.describe());
        self.close_attempt(end, now);
        self.set_state(TaskState::Abandoned, now);
        Ok(())
    }

    /// Pending | Leased | Failed -> Cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), PoolError> {
        self.check(TaskState::Cancelled)?;
        self.close_attempt(AttemptEnd::Cancelled, now);
        self.next_run_at = None;
        self.set_state(TaskState::Cancelled, now);
        Ok(())
    }

    pub fn grant(&self, lease: &Lease) -> LeaseGrant {
        LeaseGrant {
            token: lease.token,
            task_id: self.id,
            node_id: lease.node_id.clone(),
            payload_ref: self.payload_ref.clone(),
            priority: self.priority,
            expires_at: lease.expires_at,
        }
    }
}
