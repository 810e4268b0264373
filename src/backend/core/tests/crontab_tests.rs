//! Integration tests for the single-fire crontab.
//!
//! Tests cover:
//! - Seeding the next fire time without firing
//! - Firing once when the stored fire time is stale
//! - Competing crontabs on one key firing once between them
//! - Lock release on stop
//! - Start/stop lifecycle errors
//! - Lock release when a tick fails

use async_trait::async_trait;
use redqueue::crontab::{Crontab, CrontabOptions, CrontabTrigger};
use redqueue::error::{ErrorCode, QuError, Result};
use redqueue::message::Message;
use redqueue::store::{
    GroupInfo, InMemoryLogStore, LogStore, PendingEntry, ReadOptions, ReadStart, StreamEntry,
    StreamId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "test:crontab";
/// Fires once a year, so only forced ticks fire during a test.
const YEARLY: &str = "0 0 1 1 *";

// ============================================================================
// Helpers
// ============================================================================

fn store() -> Arc<dyn LogStore> {
    Arc::new(InMemoryLogStore::new())
}

fn options() -> CrontabOptions {
    CrontabOptions {
        lock_timeout: Duration::from_millis(500),
        acquire_timeout: Duration::from_millis(100),
        retry_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(20),
    }
}

fn crontab(store: &Arc<dyn LogStore>, expression: &str) -> Crontab {
    Crontab::with_options(Arc::clone(store), KEY, expression, options()).unwrap()
}

async fn fired(store: &Arc<dyn LogStore>) -> u64 {
    store.len(KEY).await.unwrap()
}

async fn eventually_len(store: &Arc<dyn LogStore>, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fired(store).await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stream never reached {} entries",
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn force_stale(store: &Arc<dyn LogStore>) {
    store.set(&format!("{}:next", KEY), "0").await.unwrap();
}

// ============================================================================
// Firing Tests
// ============================================================================

#[tokio::test]
async fn test_first_run_seeds_without_firing() {
    let store = store();
    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();

    let next_key = format!("{}:next", KEY);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get(&next_key).await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    crontab.stop().await.unwrap();

    assert_eq!(fired(&store).await, 0);
    let stored: i64 = store.get(&next_key).await.unwrap().unwrap().parse().unwrap();
    assert_eq!(stored, crontab.next_fire_time().unwrap());
}

#[tokio::test]
async fn test_stale_fire_time_fires_once() {
    let store = store();
    force_stale(&store).await;

    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();
    eventually_len(&store, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    crontab.stop().await.unwrap();

    assert_eq!(fired(&store).await, 1);

    let entries = store
        .range(KEY, StreamId::MIN, StreamId::MAX, None)
        .await
        .unwrap();
    let trigger: CrontabTrigger =
        serde_json::from_str(entries[0].field("payload").unwrap()).unwrap();
    assert_eq!(trigger.key, KEY);
    assert_eq!(trigger.crontab, YEARLY);
    assert!(entries[0].field("producer").unwrap().starts_with("redqueue:"));
}

#[tokio::test]
async fn test_each_stale_tick_fires() {
    let store = store();
    force_stale(&store).await;

    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();
    eventually_len(&store, 1).await;

    force_stale(&store).await;
    eventually_len(&store, 2).await;
    crontab.stop().await.unwrap();

    assert_eq!(fired(&store).await, 2);
}

#[tokio::test]
async fn test_competing_crontabs_fire_once() {
    let store = store();
    force_stale(&store).await;

    let first = crontab(&store, YEARLY);
    let second = crontab(&store, YEARLY);
    first.start().unwrap();
    second.start().unwrap();

    eventually_len(&store, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.stop().await.unwrap();
    second.stop().await.unwrap();

    assert_eq!(fired(&store).await, 1);
}

#[tokio::test]
async fn test_standby_takes_over_after_stop() {
    let store = store();
    let first = crontab(&store, YEARLY);
    let second = crontab(&store, YEARLY);
    first.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.start().unwrap();

    first.stop().await.unwrap();
    force_stale(&store).await;

    eventually_len(&store, 1).await;
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_every_second_schedule_fires_on_boundaries() {
    let store = store();
    let first = crontab(&store, "* * * * * *");
    let second = crontab(&store, "* * * * * *");
    first.start().unwrap();
    second.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    first.stop().await.unwrap();
    second.stop().await.unwrap();

    let count = fired(&store).await;
    assert!((1..=3).contains(&count), "fired {} times", count);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_stop_releases_lock() {
    let store = store();
    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();
    assert!(crontab.is_listening());

    let lock_key = format!("{}:lock", KEY);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get(&lock_key).await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    crontab.stop().await.unwrap();
    assert!(!crontab.is_listening());
    assert_eq!(store.get(&lock_key).await.unwrap(), None);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let store = store();
    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();

    let err = crontab.start().unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyListening);
    crontab.stop().await.unwrap();

    // Stopped crontabs can be started again.
    crontab.start().unwrap();
    crontab.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_when_idle() {
    let crontab = crontab(&store(), YEARLY);
    crontab.stop().await.unwrap();
    assert!(!crontab.is_listening());
}

#[tokio::test]
async fn test_invalid_expression() {
    let err = Crontab::new(store(), KEY, "every tuesday").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCrontab);
}

#[tokio::test]
async fn test_trigger_is_readable_as_message() {
    let store = store();
    force_stale(&store).await;
    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();
    eventually_len(&store, 1).await;
    crontab.stop().await.unwrap();

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handler = {
        let received = Arc::clone(&received);
        move |message: Message| {
            let received = Arc::clone(&received);
            async move {
                received.lock().push(message.payload_as::<CrontabTrigger>()?);
                message.ack().await?;
                Ok::<_, anyhow::Error>(())
            }
        }
    };
    let consumer = redqueue::consumer::Consumer::new(
        Arc::clone(&store),
        handler,
        redqueue::consumer::ConsumerOptions::new(KEY, "scheduled")
            .with_name("c1")
            .with_read_block(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    consumer.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    consumer.stop().await.unwrap();

    assert_eq!(received.lock()[0].crontab, YEARLY);
}

// ============================================================================
// Store Failure Tests
// ============================================================================

/// Delegates to an in-memory store; reading the next fire time always fails.
#[derive(Clone)]
struct UnreadableNextStore {
    inner: InMemoryLogStore,
    failed_reads: Arc<AtomicUsize>,
}

#[async_trait]
impl LogStore for UnreadableNextStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<StreamId> {
        self.inner.append(stream, fields).await
    }

    async fn create_group(&self, stream: &str, group: &str, start: StreamId, create_stream: bool) -> Result<()> {
        self.inner.create_group(stream, group, start, create_stream).await
    }

    async fn register_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        self.inner.register_consumer(stream, group, consumer).await
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        start: ReadStart,
        options: ReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        self.inner.read_group(group, consumer, stream, start, options).await
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        from: StreamId,
        count: usize,
    ) -> Result<Vec<StreamId>> {
        self.inner.claim_idle(stream, group, consumer, min_idle, from, count).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>> {
        self.inner.claim(stream, group, consumer, min_idle, ids).await
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min: StreamId,
        max: StreamId,
        count: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>> {
        self.inner.pending_range(stream, group, min, max, count, consumer).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64> {
        self.inner.ack(stream, group, ids).await
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_if_absent_with_expiry(key, value, ttl).await
    }

    async fn set_if_equal_then_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_if_equal_then_expire(key, expected, ttl).await
    }

    async fn delete_if_equal(&self, key: &str, expected: &str) -> Result<bool> {
        self.inner.delete_if_equal(key, expected).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if key.ends_with(":next") {
            self.failed_reads.fetch_add(1, Ordering::SeqCst);
            return Err(QuError::store("connection reset by peer"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn range(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        self.inner.range(stream, start, end, count).await
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        self.inner.len(stream).await
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        self.inner.groups(stream).await
    }

    async fn isolated(&self) -> Result<Arc<dyn LogStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[tokio::test]
async fn test_failed_tick_releases_lock_and_surfaces_on_stop() {
    let inner = InMemoryLogStore::new();
    let failed_reads = Arc::new(AtomicUsize::new(0));
    let store: Arc<dyn LogStore> = Arc::new(UnreadableNextStore {
        inner: inner.clone(),
        failed_reads: Arc::clone(&failed_reads),
    });
    let crontab = crontab(&store, YEARLY);
    crontab.start().unwrap();

    let lock_key = format!("{}:lock", KEY);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while failed_reads.load(Ordering::SeqCst) == 0 || inner.get(&lock_key).await.unwrap().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "lock was not released after the failed tick"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = crontab.stop().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StoreError);
    assert_eq!(failed_reads.load(Ordering::SeqCst), 1);
    assert_eq!(inner.get(&lock_key).await.unwrap(), None);
}
