//! taskpool-core
//!
//! Coordination core of a volunteer computing pool: nodes register and
//! heartbeat, tasks are leased to them, results are reconciled exactly once.
//!
//! # Modules
//! - **domain**: ids, task, node, lease, attempt, outcome, decision, errors
//! - **ports**: Clock, IdGenerator, Dispatcher, ResultStore
//! - **impls**: ChannelDispatcher, InMemoryResultStore
//! - **registry / queue / lease / reconciler**: the four stateful components
//! - **app**: PoolBuilder, TaskPool, Scheduler, status views

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod lease;
pub mod ports;
pub mod queue;
pub mod reconciler;
pub mod registry;

pub use app::{PoolBuilder, TaskPool};
pub use config::{DispatchMode, PoolConfig};
pub use domain::PoolError;
