//! Lease model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LeaseToken, NodeId, TaskId};
use crate::ports::clock::deadline;

/// Time-bounded exclusive claim of one node on one task.
///
/// A lease lives inside its task record, so a task can never hold two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub node_id: NodeId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Length of one renewal step.
    pub ttl_ms: u64,
}

impl Lease {
    pub fn new(token: LeaseToken, node_id: NodeId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token,
            node_id,
            issued_at: now,
            expires_at: deadline(now, ttl),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.token.task_id
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Push `expires_at` one ttl past `now`.
    pub fn extend(&mut self, now: DateTime<Utc>) {
        self.expires_at = deadline(now, self.ttl());
    }
}

/// What a node receives when it is handed a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub token: LeaseToken,
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub payload_ref: String,
    pub priority: u32,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::LeaseNonce;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn token() -> LeaseToken {
        LeaseToken {
            task_id: TaskId::from_ulid(Ulid::new()),
            attempt: 1,
            nonce: LeaseNonce::from_ulid(Ulid::new()),
        }
    }

    #[test]
    fn lease_is_live_strictly_before_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let lease = Lease::new(token(), NodeId::new("n1"), now, Duration::from_secs(10));

        assert!(lease.is_live(now));
        assert!(lease.is_live(now + chrono::Duration::seconds(9)));
        assert!(!lease.is_live(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn extend_restarts_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut lease = Lease::new(token(), NodeId::new("n1"), now, Duration::from_secs(10));

        let later = now + chrono::Duration::seconds(8);
        lease.extend(later);
        assert_eq!(lease.expires_at, later + chrono::Duration::seconds(10));
        assert_eq!(lease.issued_at, now);
    }
}
