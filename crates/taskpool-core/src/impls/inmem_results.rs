//! InMemoryResultStore - 開発・テスト用の結果保存先

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::TaskId;
use crate::ports::{ResultStore, ResultStoreError, StoredResult};

#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<(TaskId, u32), StoredResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, result: StoredResult) -> Result<(), ResultStoreError> {
        self.results
            .write()
            .insert((result.task_id, result.attempt), result);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<StoredResult>, ResultStoreError> {
        let results = self.results.read();
        Ok(results
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.attempt)
            .cloned())
    }

    async fn discard(&self, task_id: TaskId, attempt: u32) -> Result<(), ResultStoreError> {
        self.results.write().remove(&(task_id, attempt));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeId;
    use chrono::Utc;
    use ulid::Ulid;

    fn result(task_id: TaskId, attempt: u32, payload: serde_json::Value) -> StoredResult {
        StoredResult {
            task_id,
            attempt,
            node_id: NodeId::new("n1"),
            payload,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn same_attempt_overwrites() {
        let store = InMemoryResultStore::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        store.put(result(task_id, 1, serde_json::json!(1))).await.unwrap();
        store.put(result(task_id, 1, serde_json::json!(2))).await.unwrap();

        assert_eq!(store.len(), 1);
        let got = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(got.payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn get_returns_latest_attempt() {
        let store = InMemoryResultStore::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        store.put(result(task_id, 2, serde_json::json!("b"))).await.unwrap();
        store.put(result(task_id, 1, serde_json::json!("a"))).await.unwrap();

        let got = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(got.attempt, 2);
        assert!(store.get(TaskId::from_ulid(Ulid::new())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_removes_only_that_attempt() {
        let store = InMemoryResultStore::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        store.put(result(task_id, 1, serde_json::json!("a"))).await.unwrap();
        store.put(result(task_id, 2, serde_json::json!("b"))).await.unwrap();
        store.discard(task_id, 2).await.unwrap();
        store.discard(task_id, 7).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(task_id).await.unwrap().unwrap().attempt, 1);
    }
}
