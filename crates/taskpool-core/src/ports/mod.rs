//! Ports - 抽象化レイヤー
//!
//! Pool の外側（時刻、ID、node への配送、結果の保存先）とのインターフェース。
//! 実装は `impls` にある。

pub mod clock;
pub mod dispatch;
pub mod id_generator;
pub mod result_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch::{DispatchError, Dispatcher};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::{ResultStore, ResultStoreError, StoredResult};
