//! Per-thread leases for multi-worker coordination.
//!
//! A lease grants one worker the right to append checkpoints to a thread
//! until it expires. Workers renew their lease while they make progress; an
//! expired lease may be taken over by any worker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded claim on a thread by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    /// The thread being leased.
    pub thread_id: String,
    /// The worker holding the lease.
    pub worker_id: String,
    /// When the current holder first acquired the lease.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease starting now.
    pub fn new(thread_id: impl Into<String>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            worker_id: worker_id.into(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if this lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if this lease has expired at the given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if this lease belongs to the given worker.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }

    /// The same lease with its expiry pushed to `now + ttl`.
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + ttl,
            ..self.clone()
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lease_is_live() {
        let lease = Lease::new("thread-1", "worker-a", Duration::seconds(30));

        assert!(!lease.is_expired());
        assert!(lease.is_held_by("worker-a"));
        assert!(!lease.is_held_by("worker-b"));
        assert!(lease.remaining() > Duration::seconds(25));
    }

    #[test]
    fn test_expiry_boundary() {
        let lease = Lease::new("thread-1", "worker-a", Duration::seconds(10));

        assert!(!lease.is_expired_at(lease.expires_at - Duration::milliseconds(1)));
        assert!(lease.is_expired_at(lease.expires_at));
    }

    #[test]
    fn test_renewal_keeps_holder_and_acquisition() {
        let lease = Lease::new("thread-1", "worker-a", Duration::zero());
        assert!(lease.is_expired());

        let renewed = lease.renewed(Duration::seconds(5));
        assert!(!renewed.is_expired());
        assert_eq!(renewed.worker_id, "worker-a");
        assert_eq!(renewed.acquired_at, lease.acquired_at);
    }
}
