//! Dispatcher port - lease を node に届ける（push モード）
//!
//! # 実装
//! - **ChannelDispatcher**: node ごとの tokio mpsc（プロセス内 node 用）
//!
//! 届けられなかった lease は scheduler が即座に解放する。
//! pull モード（HTTP poll）ではこの port は使わない。

use async_trait::async_trait;

use crate::domain::{LeaseGrant, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("node {0} is not connected")]
    NotConnected(NodeId),

    #[error("node {0} inbox is full")]
    Backpressure(NodeId),
}

/// Dispatcher は発行済み lease を node に送る
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// 今この node に届けられるか。false の node には lease を発行しない
    fn is_reachable(&self, _node_id: &NodeId) -> bool {
        true
    }

    async fn dispatch(&self, grant: LeaseGrant) -> Result<(), DispatchError>;
}
