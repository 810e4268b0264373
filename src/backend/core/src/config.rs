//! Configuration management.
//!
//! Sources, lowest precedence first: an optional file, then environment
//! variables prefixed `REDQUEUE` with `__` as the nesting separator
//! (`REDQUEUE__REDIS__URL`, `REDQUEUE__LOGGING__LEVEL`).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::consumer::{ConsumerOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_IDLE_TIME};
use crate::crontab::parse_schedule;
use crate::error::{QuError, Result};
use crate::registry::{QueueOptions, DEFAULT_GROUP};
use crate::store::StreamId;
use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queues by stream key
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,

    /// Standalone schedules run by the scheduler binary
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// One queue and its consumer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Consumer group
    #[serde(default = "default_group")]
    pub group: String,

    /// Entries claimed, read and dispatched per iteration
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Consumer name; host-derived when absent
    pub name: Option<String>,

    /// Idle time before another consumer may claim an entry
    #[serde(default = "default_max_idle_time", with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Retries before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    /// Dead-letter stream; `<key>:dlq` when absent
    pub dlq: Option<String>,

    /// Entries at or before this id are skipped
    #[serde(default = "default_initial_id")]
    pub initial_id: String,

    /// Crontab firing trigger messages into this queue
    pub cron: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            concurrency: default_concurrency(),
            name: None,
            max_idle_time: default_max_idle_time(),
            max_attempts: default_max_attempts(),
            dlq: None,
            initial_id: default_initial_id(),
            cron: None,
        }
    }
}

impl QueueConfig {
    pub fn initial_id(&self) -> Result<StreamId> {
        self.initial_id.parse()
    }

    pub fn consumer_options(&self, key: &str) -> Result<ConsumerOptions> {
        let mut options = ConsumerOptions::new(key, self.group.as_str())
            .with_concurrency(self.concurrency)
            .with_max_idle_time(self.max_idle_time)
            .with_max_attempts(self.max_attempts)
            .with_initial_id(self.initial_id()?);
        options.name = self.name.clone();
        options.dlq = self.dlq.clone();
        Ok(options)
    }

    pub fn queue_options(&self) -> Result<QueueOptions> {
        Ok(QueueOptions {
            cron: self.cron.clone(),
            dlq: self.dlq.clone(),
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            max_idle_time: self.max_idle_time,
            name: self.name.clone(),
            initial_id: self.initial_id()?,
        })
    }
}

/// A crontab firing into `key`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub key: String,
    pub crontab: String,
}

// Default value functions
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_group() -> String { DEFAULT_GROUP.to_string() }
fn default_concurrency() -> usize { 1 }
fn default_max_idle_time() -> Duration { DEFAULT_MAX_IDLE_TIME }
fn default_max_attempts() -> u64 { DEFAULT_MAX_ATTEMPTS }
fn default_initial_id() -> String { "0-0".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("REDQUEUE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file, overlaid with the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("REDQUEUE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.url.trim().is_empty() {
            return Err(QuError::configuration("redis.url must not be empty"));
        }

        for (key, queue) in &self.queues {
            if queue.concurrency == 0 {
                return Err(QuError::configuration(format!(
                    "queues.{}.concurrency must be at least 1",
                    key
                )));
            }
            if queue.max_attempts == 0 {
                return Err(QuError::configuration(format!(
                    "queues.{}.max_attempts must be at least 1",
                    key
                )));
            }
            queue.initial_id().map_err(|e| {
                QuError::configuration(format!("queues.{}.initial_id: {}", key, e.message()))
            })?;
            if let Some(cron) = &queue.cron {
                parse_schedule(cron).map_err(|e| {
                    QuError::configuration(format!("queues.{}.cron: {}", key, e.message()))
                })?;
            }
        }

        for schedule in &self.schedules {
            if schedule.key.is_empty() {
                return Err(QuError::configuration("schedules[].key must not be empty"));
            }
            parse_schedule(&schedule.crontab).map_err(|e| {
                QuError::configuration(format!("schedules.{}: {}", schedule.key, e.message()))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(config.queues.is_empty());
        assert!(config.validate().is_ok());

        let queue = QueueConfig::default();
        assert_eq!(queue.group, "redqueue");
        assert_eq!(queue.concurrency, 1);
        assert_eq!(queue.max_idle_time, Duration::from_secs(600));
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.initial_id().unwrap(), StreamId::MIN);
    }

    #[test]
    fn test_from_file() {
        let file = write_config(
            r#"
            [redis]
            url = "redis://cache:6379/1"

            [logging]
            level = "debug"
            format = "compact"

            [queues.orders]
            concurrency = 4
            max_idle_time = "30s"
            dlq = "orders-dead"

            [queues.reports]
            cron = "0 6 * * *"

            [[schedules]]
            key = "cleanup"
            crontab = "*/5 * * * *"
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.redis.url, "redis://cache:6379/1");
        assert_eq!(config.logging.level, "debug");

        let orders = &config.queues["orders"];
        assert_eq!(orders.concurrency, 4);
        assert_eq!(orders.max_idle_time, Duration::from_secs(30));
        let options = orders.consumer_options("orders").unwrap();
        assert_eq!(options.dlq_key(), "orders-dead");
        assert_eq!(options.group, "redqueue");

        assert_eq!(config.queues["reports"].cron.as_deref(), Some("0 6 * * *"));
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].key, "cleanup");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.queues.insert(
            "orders".to_string(),
            QueueConfig {
                concurrency: 0,
                ..Default::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_validate_rejects_bad_crontab() {
        let mut config = Config::default();
        config.schedules.push(ScheduleConfig {
            key: "cleanup".to_string(),
            crontab: "sometimes".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_initial_id() {
        let mut config = Config::default();
        config.queues.insert(
            "orders".to_string(),
            QueueConfig {
                initial_id: "yesterday".to_string(),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_options_from_config() {
        let queue = QueueConfig {
            cron: Some("* * * * *".to_string()),
            max_attempts: 7,
            ..Default::default()
        };
        let options = queue.queue_options().unwrap();
        assert_eq!(options.cron.as_deref(), Some("* * * * *"));
        assert_eq!(options.max_attempts, 7);
    }
}
