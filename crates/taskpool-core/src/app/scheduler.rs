//! Scheduler: the periodic tick (liveness sweep, expiry sweep, backoff
//! promotion, push dispatch).
//!
//! In pull mode nodes call `poll` themselves and the tick only sweeps and
//! logs metrics.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::status::PoolStats;
use crate::config::DispatchMode;
use crate::domain::{AttemptEnd, LeaseGrant, NodeCapabilities, NodeId, NodeStatus, PoolError};
use crate::lease::LeaseManager;
use crate::ports::Dispatcher;
use crate::queue::TaskQueue;
use crate::registry::NodeRegistry;

/// Retries when another caller takes the task between peek and acquire.
const LEASE_RACE_RETRIES: usize = 8;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub nodes_lost: usize,
    /// Leases ended because their node went silent.
    pub node_releases: usize,
    pub expired: usize,
    pub promoted: usize,
    pub dispatched: usize,
    pub undelivered: usize,
    /// Finished records dropped after their retention window.
    pub evicted: usize,
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    mode: DispatchMode,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<NodeRegistry>,
        leases: Arc<LeaseManager>,
        mode: DispatchMode,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Self {
        Self {
            queue,
            registry,
            leases,
            mode,
            dispatcher,
        }
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = self.sweep();
        if self.mode == DispatchMode::Push
            && let Some(dispatcher) = &self.dispatcher
        {
            self.dispatch_round(dispatcher.as_ref(), &mut report).await;
        }

        let stats = self.stats();
        debug!(
            queue_depth = stats.queue_depth,
            pending = stats.pending,
            live_leases = stats.live_leases,
            completed = stats.papers_processed,
            abandoned = stats.abandoned,
            completion_rate = stats.completion_rate,
            active_nodes = stats.active_nodes,
            "scheduler tick"
        );
        report
    }

    /// Liveness first, so a lost node's leases end as NodeLost rather
    /// than waiting out their ttl.
    pub fn sweep(&self) -> TickReport {
        let mut report = TickReport::default();
        for lost in self.registry.sweep_silent() {
            report.nodes_lost += 1;
            report.node_releases += self.leases.release_node(&lost).len();
        }
        report.expired = self.leases.sweep_expired().len();
        report.promoted = self.queue.promote_due();
        report.evicted = self.queue.evict_finished();
        report
    }

    /// Pull mode: lease the best task this node can run, if any.
    pub fn poll(&self, node_id: &NodeId) -> Result<Option<LeaseGrant>, PoolError> {
        let node = self
            .registry
            .get(node_id)
            .ok_or_else(|| PoolError::UnknownNode(node_id.clone()))?;
        match node.status {
            NodeStatus::Offline => Err(PoolError::NodeUnavailable(node_id.clone())),
            NodeStatus::Draining => Ok(None),
            NodeStatus::Online => self.lease_next(node_id, &node.capabilities),
        }
    }

    fn lease_next(
        &self,
        node_id: &NodeId,
        capabilities: &NodeCapabilities,
    ) -> Result<Option<LeaseGrant>, PoolError> {
        for _ in 0..LEASE_RACE_RETRIES {
            let Some(task_id) = self.queue.peek_next(capabilities) else {
                return Ok(None);
            };
            match self.leases.acquire(task_id, node_id, None) {
                Ok(grant) => return Ok(Some(grant)),
                Err(PoolError::TaskNotAvailable(_)) => continue,
                // Full or draining since we looked.
                Err(PoolError::NodeUnavailable(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn dispatch_round(&self, dispatcher: &dyn Dispatcher, report: &mut TickReport) {
        for node in self.registry.eligible(&BTreeSet::new()) {
            for _ in 0..node.free_slots {
                if !dispatcher.is_reachable(&node.id) {
                    break;
                }
                let grant = match self.lease_next(&node.id, &node.capabilities) {
                    Ok(Some(grant)) => grant,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(node_id = %node.id, error = %err, "skipping node this tick");
                        break;
                    }
                };

                let token = grant.token;
                match dispatcher.dispatch(grant).await {
                    Ok(()) => report.dispatched += 1,
                    Err(err) => {
                        warn!(lease = %token, error = %err, "dispatch failed, releasing lease");
                        report.undelivered += 1;
                        // Already logged by the lease manager if it fails.
                        let _ = self.leases.release(&token, AttemptEnd::Undelivered);
                        break;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::collect(self.queue.counts(), &self.registry.list())
    }

    /// Runs `tick` every `interval` until shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, mode = ?self.mode, "scheduler started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            info!("scheduler stopped");
        });
        SchedulerHandle { shutdown_tx, join }
    }
}

/// Scheduler loop handle.
/// - `request_shutdown` stops the loop before its next tick; a running tick finishes
/// - `shutdown_and_join` also waits for the loop to exit
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}
