//! Distributed mutex over the log store.
//!
//! A lock is a single key whose value is the holder's token. Acquisition is a
//! `SET NX PX`; refresh and release are atomic compare-and-set scripts, so a
//! holder can never extend or remove a lock it does not own. Every lock
//! carries a server-side expiry, which means a crashed holder releases itself
//! once `lock_timeout` has elapsed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::Result;
use crate::store::LogStore;

/// Timing parameters for [`DistributedMutex::acquire`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexOptions {
    /// Server-side expiry of the lock.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Give up acquiring after this long.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Give up after this many attempts. `None` is unlimited.
    pub acquire_attempts_limit: Option<u32>,
    /// Pause between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(10_000),
            acquire_timeout: Duration::from_millis(10_000),
            acquire_attempts_limit: None,
            retry_interval: Duration::from_millis(10),
        }
    }
}

impl MutexOptions {
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn with_attempts_limit(mut self, limit: u32) -> Self {
        self.acquire_attempts_limit = Some(limit);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// An exclusive, renewable lock identified by a per-instance token.
pub struct DistributedMutex {
    store: Arc<dyn LogStore>,
    key: String,
    identifier: String,
}

impl DistributedMutex {
    /// Create a mutex on `key` with a fresh random token.
    pub fn new(store: Arc<dyn LogStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            identifier: Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token stored as the lock value while this instance holds it.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Acquire the lock, refreshing it instead when already held.
    ///
    /// Returns `Ok(false)` when the acquire window or attempt budget runs
    /// out. Contention is never an error.
    pub async fn acquire(&self, options: &MutexOptions) -> Result<bool> {
        if self.refresh(options.lock_timeout).await? {
            trace!(key = %self.key, "Mutex refreshed");
            return Ok(true);
        }

        let deadline = Instant::now() + options.acquire_timeout;
        let mut attempt: u32 = 0;

        while Instant::now() < deadline {
            if let Some(limit) = options.acquire_attempts_limit {
                if attempt >= limit {
                    break;
                }
            }
            attempt += 1;

            if self
                .store
                .set_if_absent_with_expiry(&self.key, &self.identifier, options.lock_timeout)
                .await?
            {
                debug!(key = %self.key, attempt, "Mutex acquired");
                return Ok(true);
            }

            tokio::time::sleep(options.retry_interval).await;
        }

        debug!(key = %self.key, attempt, "Mutex acquire timed out");
        Ok(false)
    }

    /// Extend the expiry while this instance still holds the lock.
    pub async fn refresh(&self, lock_timeout: Duration) -> Result<bool> {
        self.store
            .set_if_equal_then_expire(&self.key, &self.identifier, lock_timeout)
            .await
    }

    /// Release the lock if held by this instance.
    pub async fn release(&self) -> Result<bool> {
        let released = self.store.delete_if_equal(&self.key, &self.identifier).await?;
        if released {
            debug!(key = %self.key, "Mutex released");
        }
        Ok(released)
    }
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("key", &self.key)
            .field("identifier", &self.identifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLogStore;

    fn store() -> Arc<dyn LogStore> {
        Arc::new(InMemoryLogStore::new())
    }

    #[test]
    fn test_mutex_options_default() {
        let options = MutexOptions::default();
        assert_eq!(options.lock_timeout, Duration::from_secs(10));
        assert_eq!(options.acquire_timeout, Duration::from_secs(10));
        assert_eq!(options.acquire_attempts_limit, None);
        assert_eq!(options.retry_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_identifiers_are_unique() {
        let store = store();
        let a = DistributedMutex::new(Arc::clone(&store), "lock");
        let b = DistributedMutex::new(store, "lock");
        assert_ne!(a.identifier(), b.identifier());
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = store();
        let lock = DistributedMutex::new(Arc::clone(&store), "lock");

        assert!(lock.acquire(&MutexOptions::default()).await.unwrap());
        assert_eq!(
            store.get("lock").await.unwrap().as_deref(),
            Some(lock.identifier())
        );

        assert!(lock.release().await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reacquire_refreshes() {
        let lock = DistributedMutex::new(store(), "lock");
        let options = MutexOptions::default().with_attempts_limit(1);

        assert!(lock.acquire(&options).await.unwrap());
        assert!(lock.acquire(&options).await.unwrap());
    }

    #[tokio::test]
    async fn test_contention_returns_false() {
        let store = store();
        let holder = DistributedMutex::new(Arc::clone(&store), "lock");
        let other = DistributedMutex::new(store, "lock");

        assert!(holder.acquire(&MutexOptions::default()).await.unwrap());

        let options = MutexOptions::default()
            .with_acquire_timeout(Duration::from_millis(50))
            .with_retry_interval(Duration::from_millis(5));
        assert!(!other.acquire(&options).await.unwrap());
    }

    #[tokio::test]
    async fn test_attempts_limit() {
        let store = store();
        let holder = DistributedMutex::new(Arc::clone(&store), "lock");
        let other = DistributedMutex::new(store, "lock");
        assert!(holder.acquire(&MutexOptions::default()).await.unwrap());

        let started = std::time::Instant::now();
        let options = MutexOptions::default()
            .with_attempts_limit(2)
            .with_retry_interval(Duration::from_millis(1));
        assert!(!other.acquire(&options).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_foreign_holder_cannot_refresh_or_release() {
        let store = store();
        let holder = DistributedMutex::new(Arc::clone(&store), "lock");
        let other = DistributedMutex::new(Arc::clone(&store), "lock");

        assert!(holder.acquire(&MutexOptions::default()).await.unwrap());
        assert!(!other.refresh(Duration::from_secs(1)).await.unwrap());
        assert!(!other.release().await.unwrap());
        assert_eq!(
            store.get("lock").await.unwrap().as_deref(),
            Some(holder.identifier())
        );
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let store = store();
        let holder = DistributedMutex::new(Arc::clone(&store), "lock");
        let other = DistributedMutex::new(store, "lock");

        let short = MutexOptions::default().with_lock_timeout(Duration::from_millis(20));
        assert!(holder.acquire(&short).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(other.acquire(&MutexOptions::default()).await.unwrap());
        assert!(!holder.refresh(Duration::from_secs(1)).await.unwrap());
    }
}
