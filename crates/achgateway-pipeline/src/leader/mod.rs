//! Leader election for at-most-one-uploader-per-shard semantics.
//!
//! The [`LeaderLock`] trait is the gate in front of every upload callback:
//! a replica that does not hold the shard's lock skips the upload and moves
//! on. The lock is *advisory from the pipeline's perspective*: failing to
//! acquire it never fails merging, and no retry happens within a cutoff;
//! the next cutoff simply tries again.
//!
//! Locks are session-backed: the backing service expires a holder's session
//! when its process dies, so another node can acquire on the next cutoff.
//!
//! ## Implementations
//!
//! - [`memory::SessionLock`] over a shared [`memory::InMemoryLockBackend`]
//!   for tests and single-process deployments.
//! - Production deployments point the same trait at a consensus store.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

/// Lock key namespace for outbound shard leadership.
const OUTBOUND_LOCK_PREFIX: &str = "achgateway/outbound";

/// Builds the cluster-wide lock key for a shard's outbound leadership.
#[must_use]
pub fn outbound_lock_key(shard_name: &str) -> String {
    format!("{OUTBOUND_LOCK_PREFIX}/{shard_name}")
}

/// Result of a leadership acquisition attempt.
///
/// Not holding the lock is an expected steady-state outcome for non-leader
/// replicas, so it is data rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// This process holds the lock until shutdown or session expiry.
    Acquired,
    /// Another session holds the lock.
    NotLeader {
        /// The key that was contended.
        key: String,
        /// The holder's session, if the backend reports it.
        current_leader: Option<String>,
    },
}

impl LockResult {
    /// Returns true if leadership was acquired.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Cluster-wide advisory lock, keyed by shard.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; one lock client is shared by every
/// aggregator in the process.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Attempts to acquire the named lock without blocking.
    ///
    /// Re-acquiring a key this session already holds succeeds and refreshes
    /// the session's claim.
    async fn acquire_lock(&self, key: &str) -> Result<LockResult>;

    /// Releases every lock held by this session.
    ///
    /// Called once during orderly shutdown so another replica can take over
    /// without waiting out the session TTL.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_lock_key_is_namespaced() {
        assert_eq!(outbound_lock_key("production"), "achgateway/outbound/production");
    }

    #[test]
    fn lock_result_is_leader() {
        assert!(LockResult::Acquired.is_leader());
        assert!(!LockResult::NotLeader {
            key: "achgateway/outbound/testing".into(),
            current_leader: None,
        }
        .is_leader());
    }
}
