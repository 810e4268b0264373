//! Queue registry.
//!
//! [`Qu`] binds stream keys to handlers so an application can declare its
//! queues once, send by key, and bring every consumer up or down together.
//! A queue with a `cron` option also gets a [`Crontab`] on its key, so its
//! handler receives the trigger messages.

use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::consumer::{Consumer, ConsumerOptions, MessageHandler, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_IDLE_TIME};
use crate::crontab::Crontab;
use crate::error::{QuError, Result};
use crate::message::send_message;
use crate::store::{LogStore, StreamId};

/// Consumer group used by registry consumers unless overridden.
pub const DEFAULT_GROUP: &str = "redqueue";

/// Per-queue settings.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Crontab expression firing trigger messages into this queue.
    pub cron: Option<String>,
    /// Dead-letter stream. Defaults to `<key>:dlq`.
    pub dlq: Option<String>,
    pub concurrency: usize,
    pub max_attempts: u64,
    pub max_idle_time: Duration,
    /// Consumer name. Defaults to the host-derived name.
    pub name: Option<String>,
    pub initial_id: StreamId,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            cron: None,
            dlq: None,
            concurrency: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            name: None,
            initial_id: StreamId::MIN,
        }
    }
}

impl QueueOptions {
    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn with_dlq(mut self, dlq: impl Into<String>) -> Self {
        self.dlq = Some(dlq.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn consumer_options(&self, key: &str, group: &str) -> ConsumerOptions {
        let mut options = ConsumerOptions::new(key, group)
            .with_concurrency(self.concurrency)
            .with_max_attempts(self.max_attempts)
            .with_max_idle_time(self.max_idle_time)
            .with_initial_id(self.initial_id);
        options.name = self.name.clone();
        options.dlq = self.dlq.clone();
        options
    }
}

struct QueueDefinition {
    handler: Arc<dyn MessageHandler>,
    options: QueueOptions,
}

/// Named queues and their consumers.
pub struct Qu {
    store: Arc<dyn LogStore>,
    group: String,
    queues: BTreeMap<String, QueueDefinition>,
    setup: Mutex<bool>,
    consumers: Mutex<BTreeMap<String, Arc<Consumer>>>,
    crontabs: Mutex<Vec<Arc<Crontab>>>,
}

impl Qu {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            group: DEFAULT_GROUP.to_string(),
            queues: BTreeMap::new(),
            setup: Mutex::new(false),
            consumers: Mutex::new(BTreeMap::new()),
            crontabs: Mutex::new(Vec::new()),
        }
    }

    /// Use a consumer group other than `redqueue`.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Declare a queue. Redeclaring a key replaces it.
    pub fn queue<H: MessageHandler>(
        mut self,
        key: impl Into<String>,
        handler: H,
        options: QueueOptions,
    ) -> Self {
        self.queues.insert(
            key.into(),
            QueueDefinition {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Declared queue keys, in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Append `payload` to the declared queue `key`.
    pub async fn send<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<StreamId> {
        if !self.queues.contains_key(key) {
            return Err(QuError::queue_not_found(key));
        }
        send_message(self.store.as_ref(), key, payload).await
    }

    /// Create a consumer for every declared queue, or for the declared ones
    /// among `keys`. Unknown keys are ignored.
    ///
    /// Fails with `ConsumersAlreadySetup` on a second call.
    pub async fn setup_consumers(
        &self,
        keys: Option<&[&str]>,
        auto_start: bool,
    ) -> Result<BTreeMap<String, Arc<Consumer>>> {
        {
            let mut setup = self.setup.lock();
            if *setup {
                return Err(QuError::consumers_already_setup());
            }
            *setup = true;
        }

        let selected: Vec<(&String, &QueueDefinition)> = self
            .queues
            .iter()
            .filter(|(key, _)| keys.map_or(true, |keys| keys.contains(&key.as_str())))
            .collect();

        let created = try_join_all(selected.iter().map(|(key, definition)| async move {
            let options = definition.options.consumer_options(key, &self.group);
            let consumer =
                Consumer::with_shared_handler(Arc::clone(&self.store), Arc::clone(&definition.handler), options)
                    .await?;
            Ok::<_, QuError>(((*key).clone(), Arc::new(consumer)))
        }))
        .await?;

        let mut crontabs = Vec::new();
        for (key, definition) in &selected {
            if let Some(expression) = &definition.options.cron {
                crontabs.push(Arc::new(Crontab::new(Arc::clone(&self.store), key.as_str(), expression)?));
            }
        }

        if auto_start {
            for (_, consumer) in &created {
                consumer.start();
            }
            for crontab in &crontabs {
                crontab.start()?;
            }
        }

        let consumers: BTreeMap<String, Arc<Consumer>> = created.into_iter().collect();
        *self.consumers.lock() = consumers.clone();
        *self.crontabs.lock() = crontabs;

        info!(
            group = %self.group,
            consumers = consumers.len(),
            auto_start,
            "Consumers set up"
        );
        Ok(consumers)
    }

    /// [`Qu::setup_consumers`] with every consumer started.
    pub async fn start_consumers(&self, keys: Option<&[&str]>) -> Result<BTreeMap<String, Arc<Consumer>>> {
        self.setup_consumers(keys, true).await
    }

    pub fn consumer(&self, key: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().get(key).cloned()
    }

    pub fn crontab(&self, key: &str) -> Option<Arc<Crontab>> {
        self.crontabs
            .lock()
            .iter()
            .find(|crontab| crontab.key() == key)
            .cloned()
    }

    /// Stop every crontab and consumer. All are stopped even if some fail;
    /// the first error is returned.
    pub async fn stop_consumers(&self) -> Result<()> {
        let crontabs: Vec<Arc<Crontab>> = self.crontabs.lock().clone();
        let consumers: Vec<Arc<Consumer>> = self.consumers.lock().values().cloned().collect();

        let mut results = join_all(crontabs.iter().map(|crontab| crontab.stop())).await;
        results.extend(join_all(consumers.iter().map(|consumer| consumer.stop())).await);

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Failed to stop cleanly");
                first_error.get_or_insert(e);
            }
        }

        info!(group = %self.group, "Consumers stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Wait until every consumer loop has exited.
    pub async fn wait_consumers(&self) {
        let consumers: Vec<Arc<Consumer>> = self.consumers.lock().values().cloned().collect();
        join_all(consumers.iter().map(|consumer| consumer.wait())).await;
    }

    /// Start all consumers, run until `signal` resolves, then stop them.
    pub async fn run_until<F: Future<Output = ()>>(&self, signal: F) -> Result<()> {
        self.start_consumers(None).await?;
        signal.await;
        self.stop_consumers().await
    }
}

impl std::fmt::Debug for Qu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qu")
            .field("group", &self.group)
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
