//! ResultStore port - 成功結果の保存先（外部の result storage）
//!
//! 結果は `(task_id, attempt)` をキーに保存する。同じ attempt の再送は上書きになる。
//! commit できなかった attempt の結果は `discard` で消す。
//!
//! # 実装
//! - **InMemoryResultStore**: 開発・テスト用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NodeId, PoolError, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub task_id: TaskId,
    pub attempt: u32,
    pub node_id: NodeId,
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

impl From<ResultStoreError> for PoolError {
    fn from(err: ResultStoreError) -> Self {
        match err {
            ResultStoreError::Unavailable(msg) => PoolError::StorageUnavailable(msg),
        }
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, result: StoredResult) -> Result<(), ResultStoreError>;

    /// task の最新 attempt の結果
    async fn get(&self, task_id: TaskId) -> Result<Option<StoredResult>, ResultStoreError>;

    /// 1 attempt 分の結果を消す（無ければ何もしない）
    async fn discard(&self, task_id: TaskId, attempt: u32) -> Result<(), ResultStoreError>;
}
