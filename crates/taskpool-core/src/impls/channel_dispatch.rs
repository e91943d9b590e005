//! ChannelDispatcher - プロセス内 node への配送
//!
//! # 実装詳細
//! - DashMap<NodeId, mpsc::Sender<LeaseGrant>> で node ごとに inbox を管理
//! - `try_send` なので dispatch は待たない（inbox が満杯なら Backpressure）
//!
//! # 使用例
//! ```ignore
//! let dispatcher = ChannelDispatcher::new(8);
//! let mut inbox = dispatcher.connect(NodeId::new("n1"));
//! while let Some(grant) = inbox.recv().await { /* execute */ }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::{LeaseGrant, NodeId};
use crate::ports::{DispatchError, Dispatcher};

pub struct ChannelDispatcher {
    inboxes: DashMap<NodeId, mpsc::Sender<LeaseGrant>>,
    inbox_size: usize,
}

impl ChannelDispatcher {
    pub fn new(inbox_size: usize) -> Self {
        Self {
            inboxes: DashMap::new(),
            inbox_size: inbox_size.max(1),
        }
    }

    /// node の inbox を開く（既存なら差し替え）
    pub fn connect(&self, node_id: NodeId) -> mpsc::Receiver<LeaseGrant> {
        let (tx, rx) = mpsc::channel(self.inbox_size);
        self.inboxes.insert(node_id, tx);
        rx
    }

    pub fn disconnect(&self, node_id: &NodeId) {
        self.inboxes.remove(node_id);
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.inboxes
            .get(node_id)
            .is_some_and(|tx| !tx.is_closed() && tx.capacity() > 0)
    }

    async fn dispatch(&self, grant: LeaseGrant) -> Result<(), DispatchError> {
        let node_id = grant.node_id.clone();
        let Some(tx) = self.inboxes.get(&node_id).map(|tx| tx.clone()) else {
            return Err(DispatchError::NotConnected(node_id));
        };

        match tx.try_send(grant) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::Backpressure(node_id)),
            Err(TrySendError::Closed(_)) => {
                self.inboxes.remove(&node_id);
                Err(DispatchError::NotConnected(node_id))
            }
        }
    }
}
