//! Single-fire crontab.
//!
//! Any number of processes may run a [`Crontab`] for the same key; each
//! schedule tick appends exactly one trigger message to the stream `<key>`.
//! The process holding `<key>:lock` compares the schedule's next fire time
//! against the value stored in `<key>:next`. A mismatch means a tick
//! boundary has passed: the stored value is advanced and a trigger appended.
//! The first run only seeds `<key>:next` and never fires.

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{QuError, Result};
use crate::message::send_message;
use crate::mutex::{DistributedMutex, MutexOptions};
use crate::store::LogStore;
use crate::telemetry::QueueMetrics;

/// Payload of a trigger message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabTrigger {
    pub key: String,
    pub crontab: String,
    pub triggered: DateTime<Utc>,
}

/// Timing for the crontab loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrontabOptions {
    /// Expiry of the crontab lock. The holder refreshes it every poll.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How long one attempt to take the lock may wait.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Pause between lock attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Pause between schedule checks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for CrontabOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2000),
            acquire_timeout: Duration::from_millis(2000),
            retry_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of one locked schedule check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Seeded,
    Waiting,
    Fired,
}

struct CrontabInner {
    store: Arc<dyn LogStore>,
    key: String,
    expression: String,
    schedule: Schedule,
    lock: DistributedMutex,
    options: CrontabOptions,
    listening: AtomicBool,
}

/// A cluster-wide recurring trigger.
pub struct Crontab {
    inner: Arc<CrontabInner>,
    runtime: Mutex<Option<(watch::Sender<bool>, JoinHandle<Result<()>>)>>,
}

impl Crontab {
    /// Parse `expression` and bind it to `key`.
    ///
    /// Accepts standard five-field expressions (`m h dom mon dow`) as well
    /// as the six and seven-field forms with seconds and year.
    pub fn new(store: Arc<dyn LogStore>, key: impl Into<String>, expression: &str) -> Result<Self> {
        Self::with_options(store, key, expression, CrontabOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn LogStore>,
        key: impl Into<String>,
        expression: &str,
        options: CrontabOptions,
    ) -> Result<Self> {
        let key = key.into();
        let schedule = parse_schedule(expression)?;
        let lock = DistributedMutex::new(Arc::clone(&store), format!("{}:lock", key));

        Ok(Self {
            inner: Arc::new(CrontabInner {
                store,
                key,
                expression: expression.to_string(),
                schedule,
                lock,
                options,
                listening: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn crontab(&self) -> &str {
        &self.inner.expression
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Start the loop in the background.
    ///
    /// Fails with `AlreadyListening` when already started.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(QuError::already_listening(&self.inner.key));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run(shutdown_rx).await;
            if let Err(e) = &result {
                e.log();
            }
            result
        });

        *runtime = Some((shutdown_tx, task));
        info!(key = %self.inner.key, crontab = %self.inner.expression, "Crontab listening");
        Ok(())
    }

    /// Stop listening, wait for the loop to exit and release the lock.
    pub async fn stop(&self) -> Result<()> {
        let running = self.runtime.lock().take();
        self.inner.listening.store(false, Ordering::SeqCst);

        let Some((shutdown, task)) = running else {
            return Ok(());
        };
        let _ = shutdown.send(true);

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(QuError::internal(format!("crontab task failed: {}", e))),
        };
        info!(key = %self.inner.key, "Crontab stopped");
        result
    }

    /// Epoch milliseconds of the next scheduled fire time.
    pub fn next_fire_time(&self) -> Result<i64> {
        self.inner.next_fire_time()
    }
}

impl std::fmt::Debug for Crontab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crontab")
            .field("key", &self.inner.key)
            .field("crontab", &self.inner.expression)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl CrontabInner {
    fn next_key(&self) -> String {
        format!("{}:next", self.key)
    }

    fn mutex_options(&self) -> MutexOptions {
        MutexOptions::default()
            .with_lock_timeout(self.options.lock_timeout)
            .with_acquire_timeout(self.options.acquire_timeout)
            .with_retry_interval(self.options.retry_interval)
    }

    fn next_fire_time(&self) -> Result<i64> {
        self.schedule
            .upcoming(Utc)
            .next()
            .map(|at| at.timestamp_millis())
            .ok_or_else(|| QuError::invalid_crontab(&self.expression, "no upcoming fire time"))
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let result = self.poll(&mut shutdown).await;
        // Released on the error path too.
        let released = self.lock.release().await;
        result?;
        released?;
        Ok(())
    }

    async fn poll(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mutex_options = self.mutex_options();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let acquired = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                acquired = self.lock.acquire(&mutex_options) => acquired?,
            };
            if !acquired {
                trace!(key = %self.key, "Crontab lock held elsewhere");
                continue;
            }

            if self.tick().await? == Tick::Seeded {
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        Ok(())
    }

    /// Compare the stored next fire time with the schedule, firing on mismatch.
    /// Must only run while holding the lock.
    async fn tick(&self) -> Result<Tick> {
        let next = self.next_fire_time()?;
        let next_key = self.next_key();

        let stored = self.store.get(&next_key).await?;
        let Some(stored) = stored else {
            self.store.set(&next_key, &next.to_string()).await?;
            debug!(key = %self.key, next, "Crontab seeded");
            return Ok(Tick::Seeded);
        };

        if stored.trim().parse::<i64>().ok() == Some(next) {
            return Ok(Tick::Waiting);
        }

        self.store.set(&next_key, &next.to_string()).await?;
        let trigger = CrontabTrigger {
            key: self.key.clone(),
            crontab: self.expression.clone(),
            triggered: Utc::now(),
        };
        let id = send_message(self.store.as_ref(), &self.key, &trigger).await?;

        QueueMetrics::crontab_fired(&self.key);
        info!(key = %self.key, message_id = %id, previous = %stored, next, "Crontab fired");
        Ok(Tick::Fired)
    }
}

/// Parse a cron expression, normalizing the five-field form.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let normalized = normalize_expression(expression);
    Schedule::from_str(&normalized).map_err(|e| QuError::invalid_crontab(expression, e))
}

/// Five-field expressions gain a leading seconds field and have numeric
/// days of week (0 or 7 = Sunday) shifted to the 1 = Sunday numbering
/// used by the `cron` crate.
fn normalize_expression(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }

    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        day_of_week(fields[4])
    )
}

fn day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = shift_day_range(range);
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day_range(range: &str) -> String {
    let shift = |day: &str| -> Option<u8> {
        let day: u8 = day.parse().ok()?;
        (day <= 7).then(|| if day == 7 { 1 } else { day + 1 })
    };

    match range.split_once('-') {
        Some((start, end)) => match (shift(start), shift(end)) {
            // A range ending on Sunday (7) wraps past Saturday.
            (Some(1), Some(1)) if end == "7" => "1-7".to_string(),
            (Some(start), Some(1)) if end == "7" => format!("{}-7,1", start),
            (Some(start), Some(end)) => format!("{}-{}", start, end),
            _ => range.to_string(),
        },
        None => match shift(range) {
            Some(day) => day.to_string(),
            None => range.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLogStore;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_normalize_five_field_expression() {
        assert_eq!(normalize_expression("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_expression("0 0 1 1 *"), "0 0 0 1 1 *");
        assert_eq!(normalize_expression("*/5 * * * MON-FRI"), "0 */5 * * * MON-FRI");
    }

    #[test]
    fn test_normalize_leaves_six_fields() {
        assert_eq!(normalize_expression("30  0 0 * * *"), "30 0 0 * * *");
    }

    #[test]
    fn test_day_of_week_shift() {
        assert_eq!(day_of_week("0"), "1");
        assert_eq!(day_of_week("7"), "1");
        assert_eq!(day_of_week("1-5"), "2-6");
        assert_eq!(day_of_week("0,6"), "1,7");
        assert_eq!(day_of_week("5-7"), "6-7,1");
        assert_eq!(day_of_week("0-7"), "1-7");
        assert_eq!(day_of_week("*/2"), "*/2");
        assert_eq!(day_of_week("MON"), "MON");
    }

    #[test]
    fn test_parse_schedule_monday() {
        let schedule = parse_schedule("30 9 * * 1").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn test_parse_schedule_rejects_garbage() {
        let err = parse_schedule("every tuesday").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidCrontab);
    }

    #[test]
    fn test_crontab_trigger_json() {
        let trigger = CrontabTrigger {
            key: "reports".to_string(),
            crontab: "0 0 * * *".to_string(),
            triggered: Utc::now(),
        };
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["key"], "reports");
        assert!(json["triggered"].is_string());
    }

    #[tokio::test]
    async fn test_next_fire_time_is_in_future() {
        let store: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let crontab = Crontab::new(store, "reports", "* * * * *").unwrap();
        assert!(crontab.next_fire_time().unwrap() > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let store: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
        let crontab = Crontab::new(store, "reports", "* * * * *").unwrap();

        assert!(!crontab.is_listening());
        crontab.start().unwrap();
        assert!(crontab.is_listening());

        let err = crontab.start().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyListening);

        crontab.stop().await.unwrap();
        assert!(!crontab.is_listening());
    }
}
