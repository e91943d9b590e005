//! Pool configuration.
//!
//! Plain numbers (seconds / milliseconds) so the same struct reads from TOML
//! and environment variables without extra parsing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::PoolError;
use crate::queue::RetryPolicy;

/// Whether the scheduler pushes leases to nodes or waits for nodes to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Pull,
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live tasks (Pending + Leased + Failed). `TASK_QUEUE_SIZE`.
    pub queue_capacity: usize,

    /// Leases a task may receive before it is abandoned.
    pub max_attempts: u32,

    pub lease_ttl_secs: u64,

    /// Silence after which a node is marked Offline.
    pub heartbeat_timeout_secs: u64,

    /// Scheduler tick; sweeps run every tick.
    pub tick_interval_ms: u64,

    /// Backoff after a reported failure. Zero requeues immediately.
    pub retry_base_delay_secs: u64,
    pub retry_multiplier: f64,

    /// Contribution credit per completed task.
    pub reward_per_task: f64,

    /// How long Completed / Abandoned / Cancelled records stay readable.
    pub terminal_retention_secs: u64,

    pub dispatch_mode: DispatchMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            max_attempts: 3,
            lease_ttl_secs: 3600,
            heartbeat_timeout_secs: 90,
            tick_interval_ms: 1000,
            retry_base_delay_secs: 0,
            retry_multiplier: 2.0,
            reward_per_task: 1.0,
            terminal_retention_secs: 3600,
            dispatch_mode: DispatchMode::Pull,
        }
    }
}

impl PoolConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_delay_secs),
            self.retry_multiplier,
        )
    }

    /// Rejects settings the pool cannot run with.
    pub fn validate(&self) -> Result<(), PoolError> {
        let fail = |msg: &str| Err(PoolError::InvalidConfig(msg.to_string()));
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.lease_ttl_secs == 0 {
            return fail("lease_ttl_secs must be at least 1");
        }
        if self.heartbeat_timeout_secs == 0 {
            return fail("heartbeat_timeout_secs must be at least 1");
        }
        if self.tick_interval_ms == 0 {
            return fail("tick_interval_ms must be at least 1");
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return fail("retry_multiplier must be a finite number >= 1.0");
        }
        if !(self.reward_per_task.is_finite() && self.reward_per_task >= 0.0) {
            return fail("reward_per_task must be a finite number >= 0");
        }
        Ok(())
    }
}
