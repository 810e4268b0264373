//! Integration tests for the distributed mutex.
//!
//! Tests cover:
//! - Mutual exclusion between holders of the same key
//! - Waiting acquirers taking over after release
//! - Expiry of abandoned locks
//! - Owner-only refresh and release
//! - Attempt limits

use redqueue::mutex::{DistributedMutex, MutexOptions};
use redqueue::store::{InMemoryLogStore, LogStore};
use std::sync::Arc;
use std::time::{Duration, Instant};

const KEY: &str = "test:mutex";

fn store() -> Arc<dyn LogStore> {
    Arc::new(InMemoryLogStore::new())
}

fn quick() -> MutexOptions {
    MutexOptions::default()
        .with_lock_timeout(Duration::from_secs(10))
        .with_acquire_timeout(Duration::from_millis(100))
        .with_retry_interval(Duration::from_millis(10))
}

// ============================================================================
// Exclusion Tests
// ============================================================================

#[tokio::test]
async fn test_second_holder_is_excluded() {
    let store = store();
    let first = DistributedMutex::new(Arc::clone(&store), KEY);
    let second = DistributedMutex::new(Arc::clone(&store), KEY);

    assert!(first.acquire(&quick()).await.unwrap());
    assert!(!second.acquire(&quick()).await.unwrap());
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some(first.identifier()));
}

#[tokio::test]
async fn test_acquire_by_holder_refreshes() {
    let store = store();
    let mutex = DistributedMutex::new(Arc::clone(&store), KEY);

    assert!(mutex.acquire(&quick()).await.unwrap());
    assert!(mutex.acquire(&quick()).await.unwrap());
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some(mutex.identifier()));
}

#[tokio::test]
async fn test_waiter_acquires_after_release() {
    let store = store();
    let first = DistributedMutex::new(Arc::clone(&store), KEY);
    let second = Arc::new(DistributedMutex::new(Arc::clone(&store), KEY));
    assert!(first.acquire(&quick()).await.unwrap());

    let started = Instant::now();
    let waiter = {
        let second = Arc::clone(&second);
        tokio::spawn(async move {
            second
                .acquire(&quick().with_acquire_timeout(Duration::from_secs(2)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert!(first.release().await.unwrap());

    assert!(waiter.await.unwrap().unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some(second.identifier()));

    assert!(second.release().await.unwrap());
    assert_eq!(store.get(KEY).await.unwrap(), None);
}

#[tokio::test]
async fn test_abandoned_lock_expires() {
    let store = store();
    let crashed = DistributedMutex::new(Arc::clone(&store), KEY);
    let survivor = DistributedMutex::new(Arc::clone(&store), KEY);

    assert!(crashed
        .acquire(&quick().with_lock_timeout(Duration::from_millis(100)))
        .await
        .unwrap());

    let options = quick().with_acquire_timeout(Duration::from_secs(2));
    assert!(survivor.acquire(&options).await.unwrap());
    assert!(!crashed.refresh(Duration::from_secs(1)).await.unwrap());
}

// ============================================================================
// Ownership Tests
// ============================================================================

#[tokio::test]
async fn test_release_by_non_owner_is_ignored() {
    let store = store();
    let owner = DistributedMutex::new(Arc::clone(&store), KEY);
    let other = DistributedMutex::new(Arc::clone(&store), KEY);

    assert!(owner.acquire(&quick()).await.unwrap());
    assert!(!other.release().await.unwrap());
    assert!(!other.refresh(Duration::from_secs(1)).await.unwrap());
    assert_eq!(store.get(KEY).await.unwrap().as_deref(), Some(owner.identifier()));
}

#[tokio::test]
async fn test_release_without_holding() {
    let mutex = DistributedMutex::new(store(), KEY);
    assert!(!mutex.release().await.unwrap());
}

#[tokio::test]
async fn test_identifiers_are_unique() {
    let store = store();
    let a = DistributedMutex::new(Arc::clone(&store), KEY);
    let b = DistributedMutex::new(Arc::clone(&store), KEY);
    assert_ne!(a.identifier(), b.identifier());
    assert_eq!(a.key(), KEY);
}

// ============================================================================
// Attempt Limit Tests
// ============================================================================

#[tokio::test]
async fn test_attempt_limit_gives_up_early() {
    let store = store();
    let owner = DistributedMutex::new(Arc::clone(&store), KEY);
    let other = DistributedMutex::new(Arc::clone(&store), KEY);
    assert!(owner.acquire(&quick()).await.unwrap());

    let options = quick()
        .with_acquire_timeout(Duration::from_secs(10))
        .with_attempts_limit(2);
    let started = Instant::now();
    assert!(!other.acquire(&options).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
}
