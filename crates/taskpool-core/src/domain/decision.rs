//! Decision model: what happens to a task whose attempt ended without success.
//!
//! Expiry, node loss, undelivered dispatch and reported failure all funnel
//! through one `Decider`, so every recovery path shares the same retry bound.

use std::time::Duration;

use super::attempt::AttemptEnd;
use super::task::TaskRecord;
use crate::queue::RetryPolicy;

/// The next action for a task whose lease ended unsuccessfully.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Back to Pending right away.
    Requeue,

    /// Park in Failed, back to Pending after `delay`.
    RetryAfter { delay: Duration },

    /// Give up (attempts exhausted).
    Abandon { reason: String },
}

/// Pure function from (task, how the attempt ended) to the next action.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, end: &AttemptEnd) -> Decision;
}

/// Attempt-bounded decider.
///
/// - Abandon once `attempt_count >= max_attempts`
/// - Reported failures wait for the retry policy's backoff
/// - Expiry, node loss and undelivered dispatch requeue immediately
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, end: &AttemptEnd) -> Decision {
        if task.attempts_exhausted() {
            return Decision::Abandon {
                reason: format!(
                    "max attempts reached: {}/{} ({})",
                    task.attempt_count,
                    task.max_attempts,
                    end.describe()
                ),
            };
        }

        match end {
            AttemptEnd::Failed(_) => {
                let delay = self.retry_policy.next_delay(task.attempt_count);
                if delay.is_zero() {
                    Decision::Requeue
                } else {
                    Decision::RetryAfter { delay }
                }
            }
            _ => Decision::Requeue,
        }
    }
}
