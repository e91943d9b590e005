//! Task queue: ordered storage of tasks, retry backoff and queue depth.

mod memory;
mod ready;
mod retry;

pub use memory::TaskQueue;
pub use retry::RetryPolicy;

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

/// Task totals per state. Terminal totals are cumulative: evicting a
/// finished record does not lower them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub leased: usize,
    pub failed: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    /// Tasks that count towards queue depth.
    pub fn live(&self) -> usize {
        self.pending + self.leased + self.failed
    }

    pub fn finished(&self) -> usize {
        self.completed + self.abandoned + self.cancelled
    }
}

/// Running per-state totals, moved on every state change.
#[derive(Debug, Default)]
pub(crate) struct StateCounters {
    pending: AtomicUsize,
    leased: AtomicUsize,
    failed: AtomicUsize,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
    cancelled: AtomicUsize,
}

impl StateCounters {
    fn slot(&self, state: TaskState) -> &AtomicUsize {
        match state {
            TaskState::Pending => &self.pending,
            TaskState::Leased => &self.leased,
            TaskState::Failed => &self.failed,
            TaskState::Completed => &self.completed,
            TaskState::Abandoned => &self.abandoned,
            TaskState::Cancelled => &self.cancelled,
        }
    }

    pub(crate) fn enter(&self, state: TaskState) {
        self.slot(state).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn moved(&self, from: TaskState, to: TaskState) {
        self.slot(from).fetch_sub(1, Ordering::AcqRel);
        self.enter(to);
    }

    pub(crate) fn snapshot(&self) -> QueueCounts {
        let load = |c: &AtomicUsize| c.load(Ordering::Acquire);
        QueueCounts {
            pending: load(&self.pending),
            leased: load(&self.leased),
            failed: load(&self.failed),
            completed: load(&self.completed),
            abandoned: load(&self.abandoned),
            cancelled: load(&self.cancelled),
        }
    }
}
