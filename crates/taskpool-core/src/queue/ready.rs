//! Ordering structures: the ready index and the retry schedule.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use chrono::{DateTime, Utc};

use crate::domain::{NodeCapabilities, TaskId};

/// Highest priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ReadyKey {
    priority: Reverse<u32>,
    seq: u64,
    task_id: TaskId,
}

impl ReadyKey {
    pub(crate) fn new(priority: u32, seq: u64, task_id: TaskId) -> Self {
        Self {
            priority: Reverse(priority),
            seq,
            task_id,
        }
    }
}

/// Pending tasks in dispatch order, each with the tags it requires.
#[derive(Debug, Default)]
pub(crate) struct ReadyIndex {
    entries: BTreeMap<ReadyKey, BTreeSet<String>>,
}

impl ReadyIndex {
    pub(crate) fn insert(&mut self, key: ReadyKey, required: BTreeSet<String>) {
        self.entries.insert(key, required);
    }

    pub(crate) fn remove(&mut self, key: &ReadyKey) {
        self.entries.remove(key);
    }

    /// First task the node is able to run.
    pub(crate) fn first_for(&self, node: &NodeCapabilities) -> Option<TaskId> {
        self.entries
            .iter()
            .find(|(_, required)| node.satisfies(required))
            .map(|(key, _)| key.task_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Retry schedule entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledTask {
    pub(crate) next_run_at: DateTime<Utc>,
    pub(crate) task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// Pops every entry due at `now`. Entries may be stale; callers re-check
/// the task before acting.
pub(crate) fn pop_due(heap: &mut BinaryHeap<ScheduledTask>, now: DateTime<Utc>) -> Vec<TaskId> {
    let mut due = Vec::new();
    while let Some(entry) = heap.peek() {
        if entry.next_run_at > now {
            break;
        }
        if let Some(entry) = heap.pop() {
            due.push(entry.task_id);
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[test]
    fn higher_priority_wins_then_fifo() {
        let (low, first, second) = (id(), id(), id());
        let mut index = ReadyIndex::default();
        index.insert(ReadyKey::new(1, 0, low), BTreeSet::new());
        index.insert(ReadyKey::new(5, 2, second), BTreeSet::new());
        index.insert(ReadyKey::new(5, 1, first), BTreeSet::new());

        let node = NodeCapabilities::default();
        assert_eq!(index.first_for(&node), Some(first));
        index.remove(&ReadyKey::new(5, 1, first));
        assert_eq!(index.first_for(&node), Some(second));
        index.remove(&ReadyKey::new(5, 2, second));
        assert_eq!(index.first_for(&node), Some(low));
    }

    #[test]
    fn skips_tasks_the_node_cannot_run() {
        let (gpu_task, plain) = (id(), id());
        let mut index = ReadyIndex::default();
        index.insert(ReadyKey::new(9, 0, gpu_task), ["gpu".to_string()].into());
        index.insert(ReadyKey::new(0, 1, plain), BTreeSet::new());

        assert_eq!(index.first_for(&NodeCapabilities::default()), Some(plain));
        assert_eq!(
            index.first_for(&NodeCapabilities::new(1).with_tag("gpu")),
            Some(gpu_task)
        );
    }

    #[test]
    fn pop_due_stops_at_future_entries() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (early, late) = (id(), id());
        let mut heap = BinaryHeap::new();
        heap.push(ScheduledTask { next_run_at: t0 + chrono::Duration::seconds(10), task_id: late });
        heap.push(ScheduledTask { next_run_at: t0, task_id: early });

        assert_eq!(pop_due(&mut heap, t0), vec![early]);
        assert_eq!(heap.len(), 1);
    }
}
