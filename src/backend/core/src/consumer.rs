//! Consumer: reliable delivery for one named identity within one group.
//!
//! Each loop iteration:
//!
//! 1. claims pending entries other consumers left idle for `max_idle_time`
//! 2. probes whether this consumer owns any pending entries
//! 3. replays its own backlog from `initial_id` (always on the first
//!    iteration), otherwise blocks for new entries
//! 4. dispatches the batch concurrently and waits for every item to settle
//!
//! Entries with an id at or before `initial_id` (the cutoff itself included)
//! are acknowledged and counted as skipped without invoking the handler.
//!
//! Handler failures never abort the loop: the item is released with
//! [`Message::noack`] and redelivered on the next backlog replay. Once an
//! item has been retried `max_attempts` times it is moved to the dead-letter
//! stream without invoking the handler. Store failures end the loop and are
//! returned from [`Consumer::stop`]. Restarting is left to the caller.

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{QuError, Result};
use crate::message::{DeliveryContext, Message, RawMessage};
use crate::store::{LogStore, ReadOptions, ReadStart, StreamEntry, StreamId};
use crate::telemetry::QueueMetrics;

/// Default idle time after which another consumer may claim an entry.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_millis(600_000);
/// Default number of retries before an entry is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u64 = 3;
/// How long a read waits for new entries.
pub const DEFAULT_READ_BLOCK: Duration = Duration::from_millis(1000);

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Processes delivered messages.
///
/// Returning `Ok` does not acknowledge the message; call [`Message::ack`]
/// when the work is done. Returning an error (or panicking) releases the
/// message for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Stream to consume.
    pub key: String,
    /// Consumer group.
    pub group: String,
    /// Maximum entries claimed, read and dispatched per iteration.
    pub concurrency: usize,
    /// Consumer name within the group. Defaults to `redqueue:consumer:<hostname>`.
    pub name: Option<String>,
    /// Idle time after which pending entries of other consumers are claimed.
    pub max_idle_time: Duration,
    /// Retries allowed before dead-lettering.
    pub max_attempts: u64,
    /// Dead-letter stream. Defaults to `<key>:dlq`.
    pub dlq: Option<String>,
    /// Entries at or before this id are acknowledged without invoking the handler.
    pub initial_id: StreamId,
    /// How long a read for new entries blocks.
    pub read_block: Duration,
}

impl ConsumerOptions {
    pub fn new(key: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            concurrency: 1,
            name: None,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dlq: None,
            initial_id: StreamId::MIN,
            read_block: DEFAULT_READ_BLOCK,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dlq(mut self, dlq: impl Into<String>) -> Self {
        self.dlq = Some(dlq.into());
        self
    }

    pub fn with_initial_id(mut self, initial_id: StreamId) -> Self {
        self.initial_id = initial_id;
        self
    }

    pub fn with_read_block(mut self, read_block: Duration) -> Self {
        self.read_block = read_block;
        self
    }

    /// The configured name, or the host-derived default.
    pub fn consumer_name(&self) -> String {
        self.name.clone().unwrap_or_else(default_consumer_name)
    }

    /// The configured dead-letter stream, or `<key>:dlq`.
    pub fn dlq_key(&self) -> String {
        self.dlq
            .clone()
            .unwrap_or_else(|| format!("{}:dlq", self.key))
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(QuError::configuration("consumer key must not be empty"));
        }
        if self.group.is_empty() {
            return Err(QuError::configuration("consumer group must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(QuError::configuration(format!(
                "concurrency for '{}' must be at least 1",
                self.key
            )));
        }
        Ok(())
    }
}

/// `redqueue:consumer:<hostname>`.
pub fn default_consumer_name() -> String {
    format!("redqueue:consumer:{}", hostname())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// State and Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
}

/// Counters for one consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Handler invocations
    pub processed: Arc<AtomicU64>,
    /// Handler invocations that returned `Ok`
    pub succeeded: Arc<AtomicU64>,
    /// Handler invocations that failed or panicked
    pub failed: Arc<AtomicU64>,
    /// Entries moved to the dead-letter stream
    pub dead_lettered: Arc<AtomicU64>,
    /// Entries acknowledged without invoking the handler
    pub skipped: Arc<AtomicU64>,
    /// Idle entries claimed from other consumers
    pub claimed: Arc<AtomicU64>,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumer
// ═══════════════════════════════════════════════════════════════════════════════

struct Runtime {
    state: ConsumerState,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<()>>>,
}

struct ConsumerInner {
    store: Arc<dyn LogStore>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    context: Arc<DeliveryContext>,
    stats: ConsumerStats,
    running: watch::Sender<bool>,
}

/// A named member of a consumer group.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    runtime: Mutex<Runtime>,
}

impl Consumer {
    /// Create the group (and stream) if missing, register the consumer name,
    /// and return an idle consumer.
    pub async fn new<H: MessageHandler>(
        store: Arc<dyn LogStore>,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<Self> {
        Self::with_shared_handler(store, Arc::new(handler), options).await
    }

    /// Like [`Consumer::new`] for a handler shared with other consumers.
    pub async fn with_shared_handler(
        store: Arc<dyn LogStore>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let name = options.consumer_name();

        match store
            .create_group(&options.key, &options.group, StreamId::MIN, true)
            .await
        {
            Ok(()) => info!(key = %options.key, group = %options.group, "Consumer group created"),
            Err(e) if e.is_group_already_exists() => {
                debug!(key = %options.key, group = %options.group, "Consumer group already exists");
            }
            Err(e) => return Err(e),
        }
        store
            .register_consumer(&options.key, &options.group, &name)
            .await?;

        let context = Arc::new(DeliveryContext {
            key: options.key.clone(),
            group: options.group.clone(),
            consumer: name,
            dlq: options.dlq_key(),
        });
        let (running, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                store,
                handler,
                options,
                context,
                stats: ConsumerStats::new(),
                running,
            }),
            runtime: Mutex::new(Runtime {
                state: ConsumerState::Idle,
                shutdown: None,
                task: None,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.options.key
    }

    pub fn group(&self) -> &str {
        &self.inner.options.group
    }

    pub fn name(&self) -> &str {
        &self.inner.context.consumer
    }

    pub fn dlq(&self) -> &str {
        &self.inner.context.dlq
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.inner.stats
    }

    pub fn state(&self) -> ConsumerState {
        self.runtime.lock().state
    }

    /// Whether the loop is currently running.
    pub fn is_consuming(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Start the loop in the background. No-op unless idle.
    pub fn start(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.state != ConsumerState::Idle {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        inner.running.send_replace(true);

        let task = tokio::spawn(async move {
            let result = inner.run(shutdown_rx).await;
            if let Err(e) = &result {
                e.log();
                error!(
                    key = %inner.options.key,
                    consumer = %inner.context.consumer,
                    error = %e,
                    "Consumer loop terminated"
                );
            }
            inner.running.send_replace(false);
            result
        });

        runtime.state = ConsumerState::Running;
        runtime.shutdown = Some(shutdown_tx);
        runtime.task = Some(task);
    }

    /// Signal the loop to exit and wait until it has.
    ///
    /// The in-flight batch completes first. Returns the store error that
    /// ended the loop, if it ended on its own.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, task) = {
            let mut runtime = self.runtime.lock();
            if runtime.state == ConsumerState::Idle {
                return Ok(());
            }
            runtime.state = ConsumerState::Stopping;
            (runtime.shutdown.take(), runtime.task.take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        let result = match task {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(QuError::internal(format!("consumer task failed: {}", e))),
            },
            None => Ok(()),
        };

        self.runtime.lock().state = ConsumerState::Idle;
        result
    }

    /// Wait until the loop is no longer running.
    pub async fn wait(&self) {
        let mut running = self.inner.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("key", &self.inner.options.key)
            .field("group", &self.inner.options.group)
            .field("name", &self.inner.context.consumer)
            .field("state", &self.state())
            .finish()
    }
}

impl ConsumerInner {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let store = self.store.isolated().await?;

        info!(
            key = %self.options.key,
            group = %self.options.group,
            consumer = %self.context.consumer,
            concurrency = self.options.concurrency,
            "Consumer started"
        );

        let mut first = true;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(entries) = self.poll(&store, first, &mut shutdown).await? else {
                break;
            };
            first = false;

            self.dispatch_batch(&store, entries).await?;
            tokio::task::yield_now().await;
        }

        info!(
            key = %self.options.key,
            consumer = %self.context.consumer,
            "Consumer stopped"
        );
        Ok(())
    }

    /// Claim, probe and read. `None` when shutdown arrived during the read.
    async fn poll(
        &self,
        store: &Arc<dyn LogStore>,
        first: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<StreamEntry>>> {
        let options = &self.options;
        let name = self.context.consumer.as_str();

        let claimed = store
            .claim_idle(
                &options.key,
                &options.group,
                name,
                options.max_idle_time,
                StreamId::MIN,
                options.concurrency,
            )
            .await?;
        if !claimed.is_empty() {
            let count = claimed.len() as u64;
            self.stats.claimed.fetch_add(count, Ordering::Relaxed);
            QueueMetrics::claimed(&options.key, count);
            debug!(key = %options.key, consumer = %name, count, "Claimed idle messages");
        }

        let oldest = store
            .pending_range(
                &options.key,
                &options.group,
                StreamId::MIN,
                StreamId::MAX,
                1,
                Some(name),
            )
            .await?;
        let backlog = !oldest.is_empty();

        // Replay starts after initial_id, so owned entries at or before it
        // would never be read back.
        if oldest.first().is_some_and(|p| p.id <= options.initial_id) {
            self.discard_before_initial_id(store).await?;
        }

        let (start, block) = if backlog || first {
            (ReadStart::PendingAfter(options.initial_id), None)
        } else {
            (ReadStart::NewEntries, Some(options.read_block))
        };

        let read = store.read_group(
            &options.group,
            name,
            &options.key,
            start,
            ReadOptions {
                count: options.concurrency,
                block,
                no_ack: false,
            },
        );

        tokio::select! {
            biased;
            _ = shutdown.changed() => Ok(None),
            entries = read => entries.map(Some),
        }
    }

    async fn discard_before_initial_id(&self, store: &Arc<dyn LogStore>) -> Result<()> {
        let options = &self.options;
        let stale: Vec<StreamId> = store
            .pending_range(
                &options.key,
                &options.group,
                StreamId::MIN,
                options.initial_id,
                options.concurrency,
                Some(&self.context.consumer),
            )
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let acked = store.ack(&options.key, &options.group, &stale).await?;
        self.stats.skipped.fetch_add(acked, Ordering::Relaxed);
        QueueMetrics::skipped(&options.key, acked);
        debug!(key = %options.key, count = acked, "Acknowledged pending entries before initial id");
        Ok(())
    }

    async fn dispatch_batch(&self, store: &Arc<dyn LogStore>, entries: Vec<StreamEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        trace!(key = %self.options.key, count = entries.len(), "Dispatching batch");

        join_all(entries.into_iter().map(|entry| self.dispatch(store, entry)))
            .await
            .into_iter()
            .collect()
    }

    async fn dispatch(&self, store: &Arc<dyn LogStore>, entry: StreamEntry) -> Result<()> {
        let options = &self.options;

        if entry.id <= options.initial_id {
            store.ack(&options.key, &options.group, &[entry.id]).await?;
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            QueueMetrics::skipped(&options.key, 1);
            trace!(key = %options.key, message_id = %entry.id, "Skipped message before initial id");
            return Ok(());
        }

        let Some(raw) = RawMessage::from_entry(&entry) else {
            warn!(
                key = %options.key,
                message_id = %entry.id,
                "Acknowledging pending entry without payload"
            );
            store.ack(&options.key, &options.group, &[entry.id]).await?;
            return Ok(());
        };

        let delivery_count = store
            .pending_range(
                &options.key,
                &options.group,
                entry.id,
                entry.id,
                1,
                Some(&self.context.consumer),
            )
            .await?
            .first()
            .map_or(1, |p| p.delivery_count);
        let retries = delivery_count.saturating_sub(1);

        let message = Message::new(
            entry.id,
            raw,
            retries,
            Arc::clone(&self.context),
            Arc::clone(store),
        );

        if retries >= options.max_attempts {
            message.move_to_dlq().await?;
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            QueueMetrics::dead_lettered(&options.key);
            warn!(
                key = %options.key,
                message_id = %entry.id,
                retries,
                dlq = %self.context.dlq,
                "Retries exhausted, message moved to dead-letter stream"
            );
            return Ok(());
        }

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let outcome = AssertUnwindSafe(self.handler.handle(message.clone()))
            .catch_unwind()
            .await;

        let detail = match outcome {
            Ok(Ok(())) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        let failure = QuError::handler_failed(&options.key, &entry.id.to_string(), detail);

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::failed(&options.key);
        warn!(
            key = %options.key,
            message_id = %entry.id,
            retries,
            error_code = %failure.code(),
            error = %failure.message(),
            "Handler failed, releasing message for redelivery"
        );
        message.noack().await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLogStore;

    #[test]
    fn test_consumer_options_defaults() {
        let options = ConsumerOptions::new("orders", "kitchen");
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.max_idle_time, Duration::from_secs(600));
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.initial_id, StreamId::MIN);
        assert_eq!(options.dlq_key(), "orders:dlq");
        assert!(options.consumer_name().starts_with("redqueue:consumer:"));
    }

    #[test]
    fn test_consumer_options_overrides() {
        let options = ConsumerOptions::new("orders", "kitchen")
            .with_name("c1")
            .with_dlq("dead")
            .with_concurrency(4);
        assert_eq!(options.consumer_name(), "c1");
        assert_eq!(options.dlq_key(), "dead");
        assert_eq!(options.concurrency, 4);
    }

    #[test]
    fn test_consumer_options_validate() {
        assert!(ConsumerOptions::new("orders", "kitchen").validate().is_ok());
        assert!(ConsumerOptions::new("", "kitchen").validate().is_err());
        assert!(ConsumerOptions::new("orders", "").validate().is_err());
        assert!(ConsumerOptions::new("orders", "kitchen")
            .with_concurrency(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_consumer_stats() {
        let stats = ConsumerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.dead_lettered(), 0);

        stats.failed.fetch_add(2, Ordering::Relaxed);
        assert_eq!(stats.failed(), 2);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked: boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked: bang");

        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }

    #[tokio::test]
    async fn test_new_registers_group_and_consumer() {
        let store: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let handler = |_message: Message| async { Ok::<_, anyhow::Error>(()) };

        let first = Consumer::new(
            Arc::clone(&store),
            handler,
            ConsumerOptions::new("orders", "kitchen").with_name("c1"),
        )
        .await
        .unwrap();
        let _second = Consumer::new(
            Arc::clone(&store),
            handler,
            ConsumerOptions::new("orders", "kitchen").with_name("c2"),
        )
        .await
        .unwrap();

        let groups = store.groups("orders").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "kitchen");
        assert_eq!(groups[0].consumers, 2);
        assert_eq!(first.state(), ConsumerState::Idle);
        assert!(!first.is_consuming());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_settles() {
        let store: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let consumer = Consumer::new(
            store,
            |_message: Message| async { Ok::<_, anyhow::Error>(()) },
            ConsumerOptions::new("orders", "kitchen")
                .with_name("c1")
                .with_read_block(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        consumer.start();
        consumer.start();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert!(consumer.is_consuming());

        tokio::time::sleep(Duration::from_millis(30)).await;
        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Idle);
        assert!(!consumer.is_consuming());

        consumer.stop().await.unwrap();
    }
}
