//! PoolBuilder - pool の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - port の差し替え（Clock / Dispatcher / ResultStore / Decider）

use std::sync::Arc;

use crate::app::scheduler::{Scheduler, SchedulerHandle, TickReport};
use crate::app::status::{NodeView, PoolStats};
use crate::config::{DispatchMode, PoolConfig};
use crate::domain::{
    Decider, DefaultDecider, Lease, LeaseGrant, LeaseToken, NodeCapabilities, NodeId, NodeRecord,
    NodeStatus, Outcome, PoolError, SubmitAck, TaskId, TaskRecord, TaskState, TaskSubmission,
};
use crate::impls::InMemoryResultStore;
use crate::lease::LeaseManager;
use crate::ports::{
    Clock, Dispatcher, ResultStore, StoredResult, SystemClock, UlidGenerator,
};
use crate::queue::TaskQueue;
use crate::reconciler::ResultReconciler;
use crate::registry::NodeRegistry;

/// PoolBuilder は TaskPool を構築
///
/// # 使用例
/// ```ignore
/// let pool = PoolBuilder::new()
///     .config(PoolConfig::default())
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() 時に PoolConfig::validate() を実行
/// - push モードなのに Dispatcher が無ければ InvalidConfig
pub struct PoolBuilder {
    config: PoolConfig,
    clock: Option<Arc<dyn Clock>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    result_store: Option<Arc<dyn ResultStore>>,
    decider: Option<Arc<dyn Decider>>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            clock: None,
            dispatcher: None,
            result_store: None,
            decider: None,
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// 省略時は SystemClock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// push モードで必須
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// 省略時は InMemoryResultStore
    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.result_store = Some(store);
        self
    }

    /// 省略時は config の retry policy を使う DefaultDecider
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<TaskPool, PoolError> {
        self.config.validate()?;
        if self.config.dispatch_mode == DispatchMode::Push && self.dispatcher.is_none() {
            return Err(PoolError::InvalidConfig(
                "dispatch_mode = push requires a dispatcher".to_string(),
            ));
        }

        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())) as Arc<dyn Decider>);
        let store = self
            .result_store
            .unwrap_or_else(|| Arc::new(InMemoryResultStore::new()) as Arc<dyn ResultStore>);

        let registry = Arc::new(NodeRegistry::new(clock.clone(), config.heartbeat_timeout()));
        let queue = Arc::new(
            TaskQueue::new(
                config.queue_capacity,
                config.max_attempts,
                registry.clone(),
                clock.clone(),
                Arc::new(UlidGenerator::new(clock.clone())),
            )
            .with_retention(config.terminal_retention()),
        );
        let leases = Arc::new(LeaseManager::new(
            queue.clone(),
            decider,
            clock.clone(),
            config.lease_ttl(),
        ));
        let reconciler = Arc::new(ResultReconciler::new(
            queue.clone(),
            registry.clone(),
            leases.clone(),
            store.clone(),
            clock.clone(),
            config.reward_per_task,
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            registry.clone(),
            leases.clone(),
            config.dispatch_mode,
            self.dispatcher,
        ));

        Ok(TaskPool {
            config: Arc::new(config),
            clock,
            registry,
            queue,
            leases,
            reconciler,
            scheduler,
            store,
        })
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// TaskPool は組み立て済みの coordination core
///
/// HTTP 層や simulator はこの型だけを触る。clone は安価（Arc のみ）。
#[derive(Clone)]
pub struct TaskPool {
    config: Arc<PoolConfig>,
    clock: Arc<dyn Clock>,
    registry: Arc<NodeRegistry>,
    queue: Arc<TaskQueue>,
    leases: Arc<LeaseManager>,
    reconciler: Arc<ResultReconciler>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn ResultStore>,
}

impl TaskPool {
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    // --- nodes ---

    pub fn register_node(&self, node_id: NodeId, capabilities: NodeCapabilities) -> NodeRecord {
        self.registry.register(node_id, capabilities)
    }

    pub fn heartbeat(&self, node_id: &NodeId) -> Result<NodeStatus, PoolError> {
        self.registry.heartbeat(node_id)
    }

    pub fn drain(&self, node_id: &NodeId) -> Result<(), PoolError> {
        self.registry.drain(node_id)
    }

    pub fn poll(&self, node_id: &NodeId) -> Result<Option<LeaseGrant>, PoolError> {
        self.scheduler.poll(node_id)
    }

    // --- tasks ---

    pub fn submit(&self, payload_ref: impl Into<String>, priority: u32) -> Result<TaskId, PoolError> {
        self.queue.submit(payload_ref, priority)
    }

    pub fn submit_with(&self, submission: TaskSubmission) -> Result<TaskId, PoolError> {
        self.queue.submit_with(submission)
    }

    pub fn task(&self, task_id: TaskId) -> Result<TaskRecord, PoolError> {
        self.queue
            .get(task_id)
            .ok_or(PoolError::UnknownTask(task_id))
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<TaskState, PoolError> {
        self.leases.cancel(task_id)
    }

    // --- leases & results ---

    pub fn acquire(&self, task_id: TaskId, node_id: &NodeId) -> Result<LeaseGrant, PoolError> {
        self.leases.acquire(task_id, node_id, None)
    }

    pub fn renew(&self, token: &LeaseToken) -> Result<Lease, PoolError> {
        self.leases.renew(token)
    }

    pub async fn submit_result(
        &self,
        token: LeaseToken,
        outcome: Outcome,
    ) -> Result<SubmitAck, PoolError> {
        self.reconciler.submit_result(token, outcome).await
    }

    /// Completed task の結果。完了した attempt 以外の結果は返さない
    ///
    /// 退避済み（evict 済み）の task は store の内容をそのまま返す。
    pub async fn result(&self, task_id: TaskId) -> Result<Option<StoredResult>, PoolError> {
        let completed_attempt = match self.queue.get(task_id) {
            Some(record) if record.state == TaskState::Completed => Some(record.attempt_count),
            Some(_) => return Ok(None),
            None => None,
        };
        let stored = self.store.get(task_id).await?;
        Ok(stored.filter(|r| completed_attempt.is_none_or(|attempt| r.attempt == attempt)))
    }

    // --- views & loop ---

    pub fn nodes(&self) -> Vec<NodeView> {
        let now = self.clock.now();
        self.registry
            .list()
            .iter()
            .map(|node| NodeView::from_record(node, now))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.scheduler.stats()
    }

    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick().await
    }

    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone().spawn(self.config.tick_interval())
    }
}
