//! Lease manager: grants, renews and ends leases.
//!
//! Every unsuccessful end (reported failure, expiry, node loss, undelivered
//! dispatch) goes through the same [`Decider`], so the attempt bound holds
//! on every path.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::{
    AttemptEnd, Decider, Decision, Lease, LeaseGrant, LeaseToken, NodeId, PoolError, TaskId,
    TaskRecord, TaskState,
};
use crate::ports::Clock;
use crate::ports::clock::deadline;
use crate::queue::TaskQueue;
use crate::registry::LostNode;

/// A lease the pool ended on its own (expiry or node loss).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedLease {
    pub token: LeaseToken,
    pub node_id: NodeId,
    pub end: AttemptEnd,
    /// State the task moved to.
    pub state: TaskState,
}

/// Expiry schedule entry, earliest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expiry {
    expires_at: DateTime<Utc>,
    token: LeaseToken,
}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.token.attempt.cmp(&self.token.attempt))
            .then_with(|| other.token.task_id.cmp(&self.token.task_id))
    }
}

pub struct LeaseManager {
    queue: Arc<TaskQueue>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,

    /// Lazily cleaned: renewals push a new entry, stale ones are skipped.
    expiries: Mutex<BinaryHeap<Expiry>>,
}

impl LeaseManager {
    pub fn new(
        queue: Arc<TaskQueue>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            decider,
            clock,
            default_ttl,
            expiries: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Leases a Pending task to `node_id`.
    ///
    /// Of any number of concurrent callers for the same task exactly one
    /// succeeds; the rest get `TaskNotAvailable`.
    pub fn acquire(
        &self,
        task_id: TaskId,
        node_id: &NodeId,
        ttl: Option<Duration>,
    ) -> Result<LeaseGrant, PoolError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let (lease, record) = self.queue.mark_leased(task_id, node_id, ttl)?;
        self.track(&lease);
        info!(
            task_id = %task_id,
            node_id = %node_id,
            attempt = lease.token.attempt,
            expires_at = %lease.expires_at,
            "lease granted"
        );
        Ok(record.grant(&lease))
    }

    /// Extends a live lease by its ttl.
    pub fn renew(&self, token: &LeaseToken) -> Result<Lease, PoolError> {
        let lease = self.queue.update(token.task_id, |record, now| {
            let state = record.state;
            match record.lease.as_mut() {
                Some(lease)
                    if state == TaskState::Leased && lease.token == *token && lease.is_live(now) =>
                {
                    lease.extend(now);
                    let renewed = lease.clone();
                    record.updated_at = now;
                    Ok(renewed)
                }
                _ => Err(PoolError::LeaseExpired(*token)),
            }
        })?;
        self.track(&lease);
        debug!(lease = %token, expires_at = %lease.expires_at, "lease renewed");
        Ok(lease)
    }

    /// Ends the live lease named by `token`.
    ///
    /// `Completed` finalizes the task. Any other end is handed to the
    /// decider. Returns the state the task moved to, or `LeaseExpired` if the
    /// token no longer names the live lease (nothing changes then).
    pub fn release(&self, token: &LeaseToken, end: AttemptEnd) -> Result<TaskState, PoolError> {
        let result = if end == AttemptEnd::Completed {
            self.queue
                .mark_completed(token)
                .map(|_| TaskState::Completed)
        } else {
            self.queue.update(token.task_id, |record, now| {
                if record.live_lease(token, now).is_none() {
                    return Err(PoolError::LeaseExpired(*token));
                }
                settle(self.decider.as_ref(), record, end.clone(), now)
            })
        };

        match &result {
            Ok(state) => info!(lease = %token, end = %end.describe(), state = ?state, "lease released"),
            Err(err) => report(err, token.task_id),
        }
        result
    }

    /// Ends every lease whose deadline has passed.
    pub fn sweep_expired(&self) -> Vec<ReleasedLease> {
        let now = self.clock.now();
        let due = {
            let mut heap = self.expiries.lock();
            let mut due = Vec::new();
            while heap.peek().is_some_and(|e| e.expires_at <= now) {
                if let Some(entry) = heap.pop() {
                    due.push(entry.token);
                }
            }
            due
        };

        let mut released = Vec::new();
        for token in due {
            let result = self.queue.update(token.task_id, |record, now| {
                let Some(node_id) = record
                    .lease
                    .as_ref()
                    .filter(|l| l.token == token && !l.is_live(now))
                    .map(|l| l.node_id.clone())
                else {
                    // Renewed or already ended.
                    return Ok(None);
                };
                let state = settle(self.decider.as_ref(), record, AttemptEnd::Expired, now)?;
                Ok(Some((node_id, state)))
            });

            match result {
                Ok(Some((node_id, state))) => {
                    warn!(lease = %token, node_id = %node_id, state = ?state, "lease expired");
                    released.push(ReleasedLease {
                        token,
                        node_id,
                        end: AttemptEnd::Expired,
                        state,
                    });
                }
                Ok(None) => {}
                Err(err) => report(&err, token.task_id),
            }
        }
        released
    }

    /// Ends every lease a lost node was holding, without waiting for expiry.
    pub fn release_node(&self, lost: &LostNode) -> Vec<ReleasedLease> {
        let mut released = Vec::new();
        for &task_id in &lost.held {
            let result = self.queue.update(task_id, |record, now| {
                let Some(token) = record
                    .lease
                    .as_ref()
                    .filter(|l| record.state == TaskState::Leased && l.node_id == lost.id)
                    .map(|l| l.token)
                else {
                    return Ok(None);
                };
                let state = settle(self.decider.as_ref(), record, AttemptEnd::NodeLost, now)?;
                Ok(Some((token, state)))
            });

            match result {
                Ok(Some((token, state))) => {
                    warn!(lease = %token, node_id = %lost.id, state = ?state, "lease released, node lost");
                    released.push(ReleasedLease {
                        token,
                        node_id: lost.id.clone(),
                        end: AttemptEnd::NodeLost,
                        state,
                    });
                }
                Ok(None) => {}
                Err(err) => report(&err, task_id),
            }
        }
        released
    }

    /// Cancels a task in any non-terminal state. A held lease dies with it.
    pub fn cancel(&self, task_id: TaskId) -> Result<TaskState, PoolError> {
        match self.queue.mark_cancelled(task_id) {
            Ok(from) => {
                info!(task_id = %task_id, from = ?from, "task cancelled");
                Ok(TaskState::Cancelled)
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "cancel refused");
                Err(err)
            }
        }
    }

    /// Leases that have not run out yet. Walks the task arena; stats use
    /// the queue's counters instead.
    pub fn live_leases(&self) -> Vec<Lease> {
        let now = self.clock.now();
        self.queue
            .list(Some(TaskState::Leased))
            .into_iter()
            .filter_map(|r| r.lease.filter(|l| l.is_live(now)))
            .collect()
    }

    fn track(&self, lease: &Lease) {
        self.expiries.lock().push(Expiry {
            expires_at: lease.expires_at,
            token: lease.token,
        });
    }
}

/// Applies the decider's verdict for an attempt that ended without success.
fn settle(
    decider: &dyn Decider,
    record: &mut TaskRecord,
    end: AttemptEnd,
    now: DateTime<Utc>,
) -> Result<TaskState, PoolError> {
    match decider.decide(record, &end) {
        Decision::Requeue => record.requeue(Some(end), now)?,
        Decision::RetryAfter { delay } => record.schedule_retry(end, deadline(now, delay), now)?,
        Decision::Abandon { reason } => {
            warn!(task_id = %record.id, reason = %reason, "task abandoned");
            record.mark_abandoned(end, now)?;
        }
    }
    Ok(record.state)
}

fn report(err: &PoolError, task_id: TaskId) {
    match err {
        PoolError::InvalidTransition { .. } => {
            error!(task_id = %task_id, error = %err, "rejected state transition");
        }
        _ => debug!(task_id = %task_id, error = %err, "lease operation refused"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, NodeCapabilities, TaskSubmission};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::queue::{QueueCounts, RetryPolicy};
    use crate::registry::NodeRegistry;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        clock: Arc<FixedClock>,
        registry: Arc<NodeRegistry>,
        queue: Arc<TaskQueue>,
        leases: LeaseManager,
    }

    fn fixture_with(policy: RetryPolicy) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let registry = Arc::new(NodeRegistry::new(clock.clone(), Duration::from_secs(90)));
        let queue = Arc::new(TaskQueue::new(
            100,
            3,
            registry.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        ));
        let leases = LeaseManager::new(
            queue.clone(),
            Arc::new(DefaultDecider::new(policy)),
            clock.clone(),
            TTL,
        );
        for id in ["n1", "n2"] {
            registry.register(NodeId::new(id), NodeCapabilities::new(4));
        }
        Fixture {
            clock,
            registry,
            queue,
            leases,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RetryPolicy::immediate())
    }

    fn n(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn concurrent_acquire_has_exactly_one_winner() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        let barrier = Barrier::new(2);

        let results: Vec<Result<LeaseGrant, PoolError>> = thread::scope(|s| {
            let handles: Vec<_> = ["n1", "n2"]
                .into_iter()
                .map(|node| {
                    let (leases, barrier) = (&f.leases, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        leases.acquire(task, &n(node), None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results.contains(&Err(PoolError::TaskNotAvailable(task))));
        assert_eq!(f.queue.get(task).unwrap().attempt_count, 1);
    }

    #[test]
    fn racing_lease_operations_keep_one_live_lease_per_task() {
        let f = fixture();
        for id in ["n3", "n4"] {
            f.registry.register(n(id), NodeCapabilities::new(8));
        }
        let tasks: Vec<TaskId> = (0..40)
            .map(|i| f.queue.submit(format!("paper:{i}"), i % 4).unwrap())
            .collect();
        let cancelled: Vec<TaskId> = tasks.iter().copied().step_by(5).collect();
        let barrier = Barrier::new(7);

        thread::scope(|s| {
            for (i, node) in ["n1", "n2", "n3", "n4"].into_iter().enumerate() {
                let (f, tasks, barrier) = (&f, &tasks, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for round in 0..5 {
                        for k in 0..tasks.len() {
                            let task = tasks[(k + i * 7 + round) % tasks.len()];
                            let _ = f.leases.acquire(task, &n(node), None);
                        }
                    }
                });
            }
            s.spawn(|| {
                barrier.wait();
                for _ in 0..10 {
                    f.clock.advance(Duration::from_secs(25));
                    f.leases.sweep_expired();
                    thread::yield_now();
                }
            });
            s.spawn(|| {
                let lost = LostNode {
                    id: n("n1"),
                    held: tasks.clone(),
                };
                barrier.wait();
                for _ in 0..10 {
                    f.leases.release_node(&lost);
                    thread::yield_now();
                }
            });
            s.spawn(|| {
                barrier.wait();
                for &task in &cancelled {
                    let _ = f.leases.cancel(task);
                }
            });
        });

        let records = f.queue.list(None);
        let mut walked = QueueCounts::default();
        let mut leased = HashSet::new();
        for record in &records {
            assert_eq!(
                record.state == TaskState::Leased,
                record.lease.is_some(),
                "{} in {:?}",
                record.id,
                record.state
            );
            assert!(record.attempt_count <= 3);
            match record.state {
                TaskState::Pending => walked.pending += 1,
                TaskState::Leased => {
                    walked.leased += 1;
                    leased.insert(record.id);
                }
                TaskState::Failed => walked.failed += 1,
                TaskState::Completed => walked.completed += 1,
                TaskState::Abandoned => walked.abandoned += 1,
                TaskState::Cancelled => walked.cancelled += 1,
            }
        }

        let mut held = HashSet::new();
        for node in f.registry.list() {
            assert!(node.active_leases.len() <= node.capabilities.capacity());
            for task in &node.active_leases {
                assert!(held.insert(*task), "{task} held by two nodes");
                let record = f.queue.get(*task).unwrap();
                let holder = record.lease.map(|l| l.node_id);
                assert_eq!(holder.as_ref(), Some(&node.id));
            }
        }
        assert_eq!(held, leased);
        assert_eq!(f.queue.counts(), walked);
        assert_eq!(f.queue.depth(), walked.live());
        for task in cancelled {
            assert!(f.queue.get(task).unwrap().state.is_terminal());
        }
    }

    #[test]
    fn acquire_on_draining_node_is_refused() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        f.registry.drain(&n("n1")).unwrap();
        assert_eq!(
            f.leases.acquire(task, &n("n1"), None).unwrap_err(),
            PoolError::NodeUnavailable(n("n1"))
        );
        assert_eq!(f.queue.get(task).unwrap().state, TaskState::Pending);
    }

    #[test]
    fn renew_extends_and_survives_old_deadline() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        let grant = f.leases.acquire(task, &n("n1"), None).unwrap();

        f.clock.advance(Duration::from_secs(50));
        let renewed = f.leases.renew(&grant.token).unwrap();
        assert_eq!(renewed.expires_at, f.clock.now() + chrono::Duration::seconds(60));

        f.clock.advance(Duration::from_secs(20));
        assert!(f.leases.sweep_expired().is_empty());
        assert_eq!(f.queue.get(task).unwrap().state, TaskState::Leased);
    }

    #[test]
    fn renew_after_expiry_fails() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        let grant = f.leases.acquire(task, &n("n1"), None).unwrap();
        f.clock.advance(TTL);
        assert_eq!(
            f.leases.renew(&grant.token).unwrap_err(),
            PoolError::LeaseExpired(grant.token)
        );
    }

    #[test]
    fn expiry_requeues_and_frees_node_slot() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        let grant = f.leases.acquire(task, &n("n1"), None).unwrap();

        f.clock.advance(TTL);
        let released = f.leases.sweep_expired();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].token, grant.token);
        assert_eq!(released[0].state, TaskState::Pending);
        assert!(f.registry.get(&n("n1")).unwrap().active_leases.is_empty());
        assert!(f.leases.live_leases().is_empty());
    }

    #[test]
    fn attempt_bound_abandons_after_max_attempts() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            f.leases.acquire(task, &n("n1"), None).unwrap();
            f.clock.advance(TTL);
            states.extend(f.leases.sweep_expired().into_iter().map(|r| r.state));
        }
        assert_eq!(
            states,
            vec![TaskState::Pending, TaskState::Pending, TaskState::Abandoned]
        );

        let record = f.queue.get(task).unwrap();
        assert_eq!(record.attempt_count, 3);
        assert_eq!(
            f.leases.acquire(task, &n("n1"), None).unwrap_err(),
            PoolError::TaskNotAvailable(task)
        );
        assert_eq!(f.queue.depth(), 0);
    }

    #[test]
    fn stale_token_changes_nothing() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        let first = f.leases.acquire(task, &n("n1"), None).unwrap();
        f.clock.advance(TTL);
        f.leases.sweep_expired();
        let second = f.leases.acquire(task, &n("n2"), None).unwrap();
        let before = f.queue.get(task).unwrap();

        assert_eq!(
            f.leases.release(&first.token, AttemptEnd::Completed).unwrap_err(),
            PoolError::LeaseExpired(first.token)
        );
        assert_eq!(
            f.leases
                .release(&first.token, AttemptEnd::Failed("late".into()))
                .unwrap_err(),
            PoolError::LeaseExpired(first.token)
        );

        let after = f.queue.get(task).unwrap();
        assert_eq!(after.state, TaskState::Leased);
        assert_eq!(after.lease.unwrap().token, second.token);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn reported_failure_waits_for_backoff() {
        let f = fixture_with(RetryPolicy::new(Duration::from_secs(5), 2.0));
        let task = f.queue.submit("paper:1", 0).unwrap();
        let grant = f.leases.acquire(task, &n("n1"), None).unwrap();

        let state = f
            .leases
            .release(&grant.token, AttemptEnd::Failed("pdf parse".into()))
            .unwrap();
        assert_eq!(state, TaskState::Failed);
        assert_eq!(f.queue.peek_next(&NodeCapabilities::default()), None);

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.queue.promote_due(), 1);
        assert_eq!(f.queue.peek_next(&NodeCapabilities::default()), Some(task));
    }

    #[test]
    fn lost_node_releases_before_expiry() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        f.leases.acquire(task, &n("n1"), None).unwrap();
        f.clock.advance(Duration::from_secs(30));
        f.registry.heartbeat(&n("n2")).unwrap();

        let lost = LostNode {
            id: n("n1"),
            held: vec![task],
        };
        let released = f.leases.release_node(&lost);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].end, AttemptEnd::NodeLost);

        let record = f.queue.get(task).unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn release_node_ignores_tasks_held_elsewhere() {
        let f = fixture();
        let task = f.queue.submit("paper:1", 0).unwrap();
        f.leases.acquire(task, &n("n2"), None).unwrap();
        let lost = LostNode {
            id: n("n1"),
            held: vec![task],
        };
        assert!(f.leases.release_node(&lost).is_empty());
        assert_eq!(f.queue.get(task).unwrap().state, TaskState::Leased);
    }

    #[test]
    fn cancel_kills_the_lease() {
        let f = fixture();
        let task = f
            .queue
            .submit_with(TaskSubmission::new("paper:1", 0))
            .unwrap();
        let grant = f.leases.acquire(task, &n("n1"), None).unwrap();

        assert_eq!(f.leases.cancel(task).unwrap(), TaskState::Cancelled);
        assert_eq!(
            f.leases.renew(&grant.token).unwrap_err(),
            PoolError::LeaseExpired(grant.token)
        );
        assert!(f.registry.get(&n("n1")).unwrap().active_leases.is_empty());
        assert!(matches!(
            f.leases.cancel(task).unwrap_err(),
            PoolError::InvalidTransition { .. }
        ));
    }
}
