//! In-memory task queue.
//!
//! Tasks live in a `DashMap` arena, one entry lock per task. Derived
//! structures (ready index, retry schedule, depth counter, node slots) are
//! only touched from [`TaskQueue::update`] while the task entry is held, so
//! they cannot drift from the records.
//!
//! Finished records are kept for a retention window, then evicted by
//! [`TaskQueue::evict_finished`]. Per-state totals are counters, so stats
//! never walk the arena.
//!
//! Lock order: task entry, then node entry, then ready index / schedule /
//! finished list.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{QueueCounts, StateCounters};
use super::ready::{ReadyIndex, ReadyKey, ScheduledTask, pop_due};
use crate::domain::{
    AttemptEnd, Lease, LeaseToken, NodeCapabilities, NodeId, PoolError, TaskId, TaskRecord,
    TaskState, TaskSubmission,
};
use crate::ports::clock::deadline;
use crate::ports::{Clock, IdGenerator};
use crate::registry::NodeRegistry;

/// Finished records stay readable this long by default.
const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

pub struct TaskQueue {
    tasks: DashMap<TaskId, TaskRecord>,
    ready: Mutex<ReadyIndex>,
    scheduled: Mutex<BinaryHeap<ScheduledTask>>,
    /// Terminal tasks in the order they finished.
    finished: Mutex<VecDeque<(DateTime<Utc>, TaskId)>>,
    retention: Duration,

    /// Live tasks (Pending + Leased + Failed).
    depth: AtomicUsize,
    states: StateCounters,
    capacity: usize,
    seq: AtomicU64,
    default_max_attempts: u32,

    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskQueue {
    pub fn new(
        capacity: usize,
        default_max_attempts: u32,
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            ready: Mutex::new(ReadyIndex::default()),
            scheduled: Mutex::new(BinaryHeap::new()),
            finished: Mutex::new(VecDeque::new()),
            retention: DEFAULT_RETENTION,
            depth: AtomicUsize::new(0),
            states: StateCounters::default(),
            capacity,
            seq: AtomicU64::new(0),
            default_max_attempts,
            registry,
            clock,
            ids,
        }
    }

    /// How long finished records stay readable before eviction.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn submit(&self, payload_ref: impl Into<String>, priority: u32) -> Result<TaskId, PoolError> {
        self.submit_with(TaskSubmission::new(payload_ref, priority))
    }

    /// Creates a Pending task. Fails with `QueueFull` once depth reaches capacity.
    pub fn submit_with(&self, submission: TaskSubmission) -> Result<TaskId, PoolError> {
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                (d < self.capacity).then_some(d + 1)
            })
            .map_err(|_| PoolError::QueueFull {
                capacity: self.capacity,
            })?;

        let now = self.clock.now();
        let id = self.ids.generate_task_id();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = TaskRecord::new(id, submission, self.default_max_attempts, seq, now);

        match self.tasks.entry(id) {
            Entry::Vacant(slot) => {
                // Index while the entry is held so no lease can slip in first.
                let record = slot.insert(record);
                self.states.enter(TaskState::Pending);
                self.ready.lock().insert(
                    ReadyKey::new(record.priority, record.seq, id),
                    record.required_capabilities.clone(),
                );
                info!(
                    task_id = %id,
                    priority = record.priority,
                    payload_ref = %record.payload_ref,
                    "task submitted"
                );
                Ok(id)
            }
            Entry::Occupied(_) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(PoolError::InvalidTransition {
                    task_id: id,
                    from: TaskState::Pending,
                    to: TaskState::Pending,
                })
            }
        }
    }

    /// Highest-priority, oldest Pending task the node is able to run.
    pub fn peek_next(&self, node: &NodeCapabilities) -> Option<TaskId> {
        self.ready.lock().first_for(node)
    }

    /// Pending -> Leased on `node_id`, taking one of the node's slots.
    ///
    /// `TaskNotAvailable` means another caller got there first.
    pub fn mark_leased(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        ttl: Duration,
    ) -> Result<(Lease, TaskRecord), PoolError> {
        self.update(task_id, |record, now| {
            if record.state != TaskState::Pending {
                return Err(PoolError::TaskNotAvailable(task_id));
            }
            self.registry.reserve_slot(node_id, task_id)?;
            let nonce = self.ids.generate_lease_nonce();
            let lease = record.mark_leased(node_id.clone(), nonce, ttl, now)?;
            Ok((lease, record.clone()))
        })
    }

    /// Leased -> Completed, only for the live lease named by `token`.
    pub fn mark_completed(&self, token: &LeaseToken) -> Result<Lease, PoolError> {
        self.update(token.task_id, |record, now| {
            let lease = record
                .live_lease(token, now)
                .cloned()
                .ok_or(PoolError::LeaseExpired(*token))?;
            record.mark_completed(now)?;
            Ok(lease)
        })
    }

    /// Leased -> Abandoned for the live lease named by `token`, whatever
    /// attempts remain. Decider-driven abandonment happens inside the lease
    /// manager's settle step instead.
    pub fn mark_abandoned(&self, token: &LeaseToken, end: AttemptEnd) -> Result<Lease, PoolError> {
        self.update(token.task_id, |record, now| {
            let lease = record
                .live_lease(token, now)
                .cloned()
                .ok_or(PoolError::LeaseExpired(*token))?;
            record.mark_abandoned(end, now)?;
            Ok(lease)
        })
    }

    /// Pending | Leased | Failed -> Cancelled.
    pub fn mark_cancelled(&self, task_id: TaskId) -> Result<TaskState, PoolError> {
        self.update(task_id, |record, now| {
            let from = record.state;
            record.mark_cancelled(now)?;
            Ok(from)
        })
    }

    /// Failed tasks whose backoff has elapsed go back to Pending.
    pub fn promote_due(&self) -> usize {
        let now = self.clock.now();
        let due = pop_due(&mut self.scheduled.lock(), now);
        let mut promoted = 0;
        for task_id in due {
            let result = self.update(task_id, |record, now| {
                let ready = record.state == TaskState::Failed
                    && record.next_run_at.is_some_and(|at| at <= now);
                if ready {
                    record.requeue(None, now)?;
                }
                Ok(ready)
            });
            if let Ok(true) = result {
                debug!(task_id = %task_id, "retry backoff elapsed, task pending again");
                promoted += 1;
            }
        }
        promoted
    }

    /// Applies `apply` to one record under its entry lock and brings the
    /// derived structures in line with whatever state it ends in.
    ///
    /// `apply` must leave the record untouched when it returns `Err`.
    pub(crate) fn update<R>(
        &self,
        task_id: TaskId,
        apply: impl FnOnce(&mut TaskRecord, DateTime<Utc>) -> Result<R, PoolError>,
    ) -> Result<R, PoolError> {
        let now = self.clock.now();
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or(PoolError::UnknownTask(task_id))?;
        let before = record.state;
        let holder = record.lease.as_ref().map(|l| l.node_id.clone());

        let out = apply(&mut *record, now)?;
        if record.state != before {
            self.reindex(&*record, before, holder);
        }
        Ok(out)
    }

    fn reindex(&self, record: &TaskRecord, before: TaskState, holder: Option<NodeId>) {
        let key = ReadyKey::new(record.priority, record.seq, record.id);
        match before {
            TaskState::Pending => self.ready.lock().remove(&key),
            TaskState::Leased => {
                if let Some(node_id) = holder {
                    self.registry.release_slot(&node_id, record.id);
                }
            }
            _ => {}
        }

        match record.state {
            TaskState::Pending => self
                .ready
                .lock()
                .insert(key, record.required_capabilities.clone()),
            TaskState::Failed => {
                if let Some(next_run_at) = record.next_run_at {
                    self.scheduled.lock().push(ScheduledTask {
                        next_run_at,
                        task_id: record.id,
                    });
                }
            }
            _ => {}
        }

        self.states.moved(before, record.state);
        if before.is_live() && record.state.is_terminal() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.finished.lock().push_back((record.updated_at, record.id));
        }
    }

    /// Drops finished records older than the retention window. Counts are
    /// unaffected; `get` on an evicted id returns `None`.
    pub fn evict_finished(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<TaskId> = {
            let mut finished = self.finished.lock();
            let mut due = Vec::new();
            while finished
                .front()
                .is_some_and(|(at, _)| deadline(*at, self.retention) <= now)
            {
                if let Some((_, task_id)) = finished.pop_front() {
                    due.push(task_id);
                }
            }
            due
        };

        let evicted = due
            .into_iter()
            .filter(|id| {
                self.tasks
                    .remove_if(id, |_, record| record.state.is_terminal())
                    .is_some()
            })
            .count();
        if evicted > 0 {
            debug!(evicted, retained = self.tasks.len(), "finished tasks evicted");
        }
        evicted
    }

    /// Records currently held, finished ones included.
    pub fn retained(&self) -> usize {
        self.tasks.len()
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tasks.get(&task_id).map(|r| r.clone())
    }

    /// Tasks in `state`, oldest first.
    pub fn list(&self, state: Option<TaskState>) -> Vec<TaskRecord> {
        let mut out: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    /// Live tasks; the number compared against capacity.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn counts(&self) -> QueueCounts {
        self.states.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<FixedClock>,
        registry: Arc<NodeRegistry>,
        queue: TaskQueue,
    }

    fn fixture(capacity: usize) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let registry = Arc::new(NodeRegistry::new(clock.clone(), Duration::from_secs(90)));
        let queue = TaskQueue::new(
            capacity,
            3,
            registry.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        );
        registry.register(NodeId::new("n1"), NodeCapabilities::new(4));
        Fixture {
            clock,
            registry,
            queue,
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn submit_counts_towards_depth_until_capacity() {
        let f = fixture(2);
        f.queue.submit("a", 0).unwrap();
        f.queue.submit("b", 0).unwrap();
        assert_eq!(f.queue.depth(), 2);
        assert_eq!(
            f.queue.submit("c", 0).unwrap_err(),
            PoolError::QueueFull { capacity: 2 }
        );
        assert_eq!(f.queue.list(None).len(), 2);
    }

    #[test]
    fn peek_returns_priority_then_fifo() {
        let f = fixture(10);
        let low = f.queue.submit("low", 1).unwrap();
        let hi_a = f.queue.submit("hi-a", 5).unwrap();
        let hi_b = f.queue.submit("hi-b", 5).unwrap();
        let node = NodeCapabilities::new(1);

        let n1 = NodeId::new("n1");
        assert_eq!(f.queue.peek_next(&node), Some(hi_a));
        f.queue.mark_leased(hi_a, &n1, TTL).unwrap();
        assert_eq!(f.queue.peek_next(&node), Some(hi_b));
        f.queue.mark_leased(hi_b, &n1, TTL).unwrap();
        assert_eq!(f.queue.peek_next(&node), Some(low));
    }

    #[test]
    fn leasing_takes_a_node_slot_and_completion_returns_it() {
        let f = fixture(10);
        let n1 = NodeId::new("n1");
        let id = f.queue.submit("a", 0).unwrap();
        let (lease, record) = f.queue.mark_leased(id, &n1, TTL).unwrap();
        assert_eq!(record.state, TaskState::Leased);
        assert!(f.registry.get(&n1).unwrap().active_leases.contains(&id));
        assert_eq!(f.queue.ready_len(), 0);

        f.queue.mark_completed(&lease.token).unwrap();
        assert!(f.registry.get(&n1).unwrap().active_leases.is_empty());
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.queue.counts().completed, 1);
    }

    #[test]
    fn second_lease_attempt_is_not_available() {
        let f = fixture(10);
        let n1 = NodeId::new("n1");
        let id = f.queue.submit("a", 0).unwrap();
        f.queue.mark_leased(id, &n1, TTL).unwrap();
        assert_eq!(
            f.queue.mark_leased(id, &n1, TTL).unwrap_err(),
            PoolError::TaskNotAvailable(id)
        );
        assert_eq!(f.queue.get(id).unwrap().attempt_count, 1);
    }

    #[test]
    fn lease_on_unknown_node_leaves_task_pending() {
        let f = fixture(10);
        let id = f.queue.submit("a", 0).unwrap();
        let ghost = NodeId::new("ghost");
        assert_eq!(
            f.queue.mark_leased(id, &ghost, TTL).unwrap_err(),
            PoolError::UnknownNode(ghost)
        );
        let record = f.queue.get(id).unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(f.queue.ready_len(), 1);
    }

    #[test]
    fn completion_after_expiry_is_rejected() {
        let f = fixture(10);
        let id = f.queue.submit("a", 0).unwrap();
        let (lease, _) = f.queue.mark_leased(id, &NodeId::new("n1"), TTL).unwrap();
        f.clock.advance(TTL);

        assert_eq!(
            f.queue.mark_completed(&lease.token).unwrap_err(),
            PoolError::LeaseExpired(lease.token)
        );
        assert_eq!(f.queue.get(id).unwrap().state, TaskState::Leased);
    }

    #[test]
    fn abandon_ends_the_live_lease_and_frees_depth() {
        let f = fixture(1);
        let n1 = NodeId::new("n1");
        let id = f.queue.submit("a", 0).unwrap();
        let (lease, _) = f.queue.mark_leased(id, &n1, TTL).unwrap();

        f.queue
            .mark_abandoned(&lease.token, AttemptEnd::Failed("corrupt pdf".into()))
            .unwrap();
        let record = f.queue.get(id).unwrap();
        assert_eq!(record.state, TaskState::Abandoned);
        assert!(record.lease.is_none());
        assert!(f.registry.get(&n1).unwrap().active_leases.is_empty());
        assert_eq!(f.queue.counts().abandoned, 1);
        assert_eq!(f.queue.depth(), 0);

        assert_eq!(
            f.queue
                .mark_abandoned(&lease.token, AttemptEnd::Expired)
                .unwrap_err(),
            PoolError::LeaseExpired(lease.token)
        );
        assert!(f.queue.submit("b", 0).is_ok());
    }

    #[test]
    fn abandon_with_expired_lease_is_rejected() {
        let f = fixture(10);
        let id = f.queue.submit("a", 0).unwrap();
        let (lease, _) = f.queue.mark_leased(id, &NodeId::new("n1"), TTL).unwrap();
        f.clock.advance(TTL);
        assert_eq!(
            f.queue
                .mark_abandoned(&lease.token, AttemptEnd::Expired)
                .unwrap_err(),
            PoolError::LeaseExpired(lease.token)
        );
        assert_eq!(f.queue.get(id).unwrap().state, TaskState::Leased);
    }

    #[test]
    fn cancel_pending_frees_depth_and_ready_slot() {
        let f = fixture(1);
        let id = f.queue.submit("a", 0).unwrap();
        assert_eq!(f.queue.mark_cancelled(id).unwrap(), TaskState::Pending);
        assert_eq!(f.queue.depth(), 0);
        assert_eq!(f.queue.peek_next(&NodeCapabilities::default()), None);
        assert!(f.queue.submit("b", 0).is_ok());
    }

    #[test]
    fn failed_task_is_promoted_after_backoff() {
        let f = fixture(10);
        let id = f.queue.submit("a", 0).unwrap();
        f.queue.mark_leased(id, &NodeId::new("n1"), TTL).unwrap();
        let retry_at = f.clock.now() + chrono::Duration::seconds(5);
        f.queue
            .update(id, |r, now| r.schedule_retry(AttemptEnd::Failed("boom".into()), retry_at, now))
            .unwrap();
        assert_eq!(f.queue.depth(), 1);
        assert_eq!(f.queue.promote_due(), 0);

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.queue.promote_due(), 1);
        assert_eq!(f.queue.get(id).unwrap().state, TaskState::Pending);
        assert_eq!(f.queue.peek_next(&NodeCapabilities::default()), Some(id));
    }

    #[test]
    fn cancelled_retry_is_not_promoted() {
        let f = fixture(10);
        let id = f.queue.submit("a", 0).unwrap();
        f.queue.mark_leased(id, &NodeId::new("n1"), TTL).unwrap();
        let retry_at = f.clock.now();
        f.queue
            .update(id, |r, now| r.schedule_retry(AttemptEnd::Failed("boom".into()), retry_at, now))
            .unwrap();
        f.queue.mark_cancelled(id).unwrap();

        assert_eq!(f.queue.promote_due(), 0);
        assert_eq!(f.queue.get(id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn eviction_drops_old_finished_records_but_keeps_counts() {
        let f = fixture(10);
        let n1 = NodeId::new("n1");
        let done = f.queue.submit("a", 0).unwrap();
        let dropped = f.queue.submit("b", 0).unwrap();
        let late = f.queue.submit("c", 0).unwrap();

        let (lease, _) = f.queue.mark_leased(done, &n1, TTL).unwrap();
        f.queue.mark_completed(&lease.token).unwrap();
        f.queue.mark_cancelled(dropped).unwrap();

        f.clock.advance(Duration::from_secs(1800));
        assert_eq!(f.queue.evict_finished(), 0);
        let (lease, _) = f.queue.mark_leased(late, &n1, TTL).unwrap();
        f.queue.mark_completed(&lease.token).unwrap();

        f.clock.advance(Duration::from_secs(1800));
        assert_eq!(f.queue.evict_finished(), 2);
        assert!(f.queue.get(done).is_none());
        assert!(f.queue.get(dropped).is_none());
        assert_eq!(f.queue.get(late).unwrap().state, TaskState::Completed);
        assert_eq!(f.queue.retained(), 1);

        f.clock.advance(Duration::from_secs(1800));
        assert_eq!(f.queue.evict_finished(), 1);
        assert_eq!(f.queue.retained(), 0);

        let counts = f.queue.counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.live(), 0);
        assert_eq!(f.queue.depth(), 0);
    }

    #[test]
    fn live_tasks_are_never_evicted() {
        let f = fixture(10);
        let pending = f.queue.submit("a", 0).unwrap();
        let leased = f.queue.submit("b", 0).unwrap();
        f.queue
            .mark_leased(leased, &NodeId::new("n1"), Duration::from_secs(86_400))
            .unwrap();

        f.clock.advance(Duration::from_secs(10 * 3600));
        assert_eq!(f.queue.evict_finished(), 0);
        assert_eq!(f.queue.get(pending).unwrap().state, TaskState::Pending);
        assert_eq!(f.queue.get(leased).unwrap().state, TaskState::Leased);
        assert_eq!(f.queue.counts().pending, 1);
        assert_eq!(f.queue.counts().leased, 1);
    }

    #[test]
    fn unknown_task_is_reported() {
        let f = fixture(10);
        let id = TaskId::from_ulid(ulid::Ulid::new());
        assert_eq!(f.queue.mark_cancelled(id).unwrap_err(), PoolError::UnknownTask(id));
    }
}
