//! Impls - ports の実装
//!
//! - **ChannelDispatcher**: プロセス内 node への push 配送
//! - **InMemoryResultStore**: 開発・テスト用の結果保存

pub mod channel_dispatch;
pub mod inmem_results;

pub use self::channel_dispatch::ChannelDispatcher;
pub use self::inmem_results::InMemoryResultStore;
