//! App - アプリケーション層
//!
//! registry / queue / lease / reconciler を組み合わせて pool を動かす。
//!
//! # 主要コンポーネント
//! - **PoolBuilder / TaskPool**: 構築とワイヤリング、外部から触る唯一の型
//! - **Scheduler**: 定期 tick（sweep・backoff 昇格・push 配送）と pull の poll
//! - **Status**: /nodes と /stats のビュー

pub mod builder;
pub mod scheduler;
pub mod status;

pub use self::builder::{PoolBuilder, TaskPool};
pub use self::scheduler::{Scheduler, SchedulerHandle, TickReport};
pub use self::status::{NodeView, PoolStats};
