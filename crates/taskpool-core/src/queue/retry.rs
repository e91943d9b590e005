//! Retry policy: decides backoff delays after a reported failure.

use std::time::Duration;

/// Exponential backoff for failed attempts.
///
/// A zero `base_delay` turns backoff off: failed tasks go straight back to
/// Pending.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// No backoff.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }

    /// Delay before the next retry.
    ///
    /// `attempts` is the number of attempts already made (1-indexed):
    /// delay = base_delay * multiplier^(attempts - 1)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}
