//! In-memory session-backed lock for tests and single-process deployments.
//!
//! An [`InMemoryLockBackend`] plays the role of the consensus store: it is
//! shared (via `Arc`) between every [`SessionLock`] client that should
//! contend for the same keys, which is how tests simulate multiple nodes in
//! one process. Holders expire with their session TTL, mirroring how a
//! session-backed service frees locks when a process dies silently.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{LeaderLock, LockResult};
use crate::error::Result;

/// Default session TTL, matching common consensus-store lease defaults.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Holder {
    session_id: String,
    expires_at: DateTime<Utc>,
}

/// Shared lock table standing in for the consensus store.
#[derive(Debug)]
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, Holder>>,
    session_ttl: Duration,
}

impl Default for InMemoryLockBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InMemoryLockBackend {
    /// Creates a backend whose sessions expire after `session_ttl`.
    #[must_use]
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn acquire(&self, key: &str, session_id: &str) -> LockResult {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        if let Some(holder) = locks.get(key) {
            if holder.expires_at > now && holder.session_id != session_id {
                return LockResult::NotLeader {
                    key: key.to_string(),
                    current_leader: Some(holder.session_id.clone()),
                };
            }
        }

        locks.insert(
            key.to_string(),
            Holder {
                session_id: session_id.to_string(),
                expires_at: self.expiry(now),
            },
        );
        LockResult::Acquired
    }

    fn release_session(&self, session_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, holder| holder.session_id != session_id);
    }

    /// Returns the unexpired holder of a key, if any.
    #[must_use]
    pub fn current_holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .get(key)
            .filter(|holder| holder.expires_at > Utc::now())
            .map(|holder| holder.session_id.clone())
    }
}

/// One process's lock client: a session over a shared backend.
#[derive(Debug)]
pub struct SessionLock {
    backend: std::sync::Arc<InMemoryLockBackend>,
    session_id: String,
}

impl SessionLock {
    /// Opens a new session against the shared backend.
    #[must_use]
    pub fn connect(backend: std::sync::Arc<InMemoryLockBackend>) -> Self {
        Self {
            backend,
            session_id: Ulid::new().to_string(),
        }
    }

    /// This client's session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl LeaderLock for SessionLock {
    async fn acquire_lock(&self, key: &str) -> Result<LockResult> {
        Ok(self.backend.acquire(key, &self.session_id))
    }

    async fn shutdown(&self) {
        self.backend.release_session(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_session_acquires() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::default());
        let lock = SessionLock::connect(backend);

        let result = lock.acquire_lock("achgateway/outbound/testing").await?;
        assert!(result.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn second_session_observes_not_leader() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::default());
        let first = SessionLock::connect(backend.clone());
        let second = SessionLock::connect(backend);

        assert!(first
            .acquire_lock("achgateway/outbound/testing")
            .await?
            .is_leader());

        let result = second.acquire_lock("achgateway/outbound/testing").await?;
        match result {
            LockResult::NotLeader {
                key,
                current_leader,
            } => {
                assert_eq!(key, "achgateway/outbound/testing");
                assert_eq!(current_leader.as_deref(), Some(first.session_id()));
            }
            LockResult::Acquired => panic!("expected NotLeader"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn reacquire_by_the_same_session_succeeds() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::default());
        let lock = SessionLock::connect(backend);

        assert!(lock.acquire_lock("k").await?.is_leader());
        assert!(lock.acquire_lock("k").await?.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_releases_all_held_keys() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::default());
        let first = SessionLock::connect(backend.clone());
        let second = SessionLock::connect(backend.clone());

        assert!(first.acquire_lock("a").await?.is_leader());
        assert!(first.acquire_lock("b").await?.is_leader());

        first.shutdown().await;

        assert!(second.acquire_lock("a").await?.is_leader());
        assert!(second.acquire_lock("b").await?.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn expired_session_frees_the_lock() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::new(Duration::from_millis(1)));
        let first = SessionLock::connect(backend.clone());
        let second = SessionLock::connect(backend);

        assert!(first.acquire_lock("k").await?.is_leader());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(second.acquire_lock("k").await?.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn keys_are_independent() -> Result<()> {
        let backend = Arc::new(InMemoryLockBackend::default());
        let first = SessionLock::connect(backend.clone());
        let second = SessionLock::connect(backend);

        assert!(first.acquire_lock("achgateway/outbound/a").await?.is_leader());
        assert!(second.acquire_lock("achgateway/outbound/b").await?.is_leader());
        Ok(())
    }
}
