//! Result reconciler: accepts node results and finalizes tasks.
//!
//! A result is applied only when its token still names the task's live
//! lease. Anything else (a late duplicate, a result for an expired attempt)
//! is acknowledged as `AlreadyFinalized` and changes nothing. A result
//! stored for an attempt that then fails to commit is discarded again.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{AttemptEnd, LeaseToken, Outcome, PoolError, SubmitAck, TaskState};
use crate::lease::LeaseManager;
use crate::ports::{Clock, ResultStore, StoredResult};
use crate::queue::TaskQueue;
use crate::registry::NodeRegistry;

pub struct ResultReconciler {
    queue: Arc<TaskQueue>,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    store: Arc<dyn ResultStore>,
    clock: Arc<dyn Clock>,
    reward_per_task: f64,
}

impl ResultReconciler {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<NodeRegistry>,
        leases: Arc<LeaseManager>,
        store: Arc<dyn ResultStore>,
        clock: Arc<dyn Clock>,
        reward_per_task: f64,
    ) -> Self {
        Self {
            queue,
            registry,
            leases,
            store,
            clock,
            reward_per_task,
        }
    }

    pub async fn submit_result(
        &self,
        token: LeaseToken,
        outcome: Outcome,
    ) -> Result<SubmitAck, PoolError> {
        let record = self
            .queue
            .get(token.task_id)
            .ok_or(PoolError::UnknownTask(token.task_id))?;
        let now = self.clock.now();
        let Some(lease) = record.live_lease(&token, now).cloned() else {
            debug!(lease = %token, state = ?record.state, "stale result ignored");
            return Ok(SubmitAck::AlreadyFinalized);
        };

        match outcome {
            Outcome::Success { payload } => {
                // Stored before the commit so a Completed task always has a result.
                self.store
                    .put(StoredResult {
                        task_id: token.task_id,
                        attempt: token.attempt,
                        node_id: lease.node_id.clone(),
                        payload,
                        submitted_at: now,
                    })
                    .await?;

                match self.leases.release(&token, AttemptEnd::Completed) {
                    Ok(state) => {
                        self.registry.credit(&lease.node_id, self.reward_per_task);
                        info!(
                            task_id = %token.task_id,
                            node_id = %lease.node_id,
                            attempt = token.attempt,
                            "task completed"
                        );
                        Ok(SubmitAck::Accepted { state })
                    }
                    Err(err) => {
                        self.discard(&token).await;
                        match err {
                            PoolError::LeaseExpired(_) => {
                                warn!(lease = %token, "lease ended while result was being stored");
                                Ok(SubmitAck::AlreadyFinalized)
                            }
                            err => Err(err),
                        }
                    }
                }
            }
            Outcome::Failure { reason } => {
                match self.leases.release(&token, AttemptEnd::Failed(reason)) {
                    Ok(state) => {
                        self.registry.record_failure(&lease.node_id);
                        Ok(SubmitAck::Accepted { state })
                    }
                    Err(PoolError::LeaseExpired(_)) => Ok(SubmitAck::AlreadyFinalized),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Drops the stored result of an attempt that did not commit. A
    /// duplicate of the committing attempt shares its key and leaves it alone.
    async fn discard(&self, token: &LeaseToken) {
        let committed = self.queue.get(token.task_id).is_some_and(|r| {
            r.state == TaskState::Completed && r.attempt_count == token.attempt
        });
        if committed {
            return;
        }
        if let Err(err) = self.store.discard(token.task_id, token.attempt).await {
            warn!(lease = %token, error = %err, "could not discard uncommitted result");
        }
    }
}
