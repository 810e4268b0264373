//! Configuration validation commands.
//!
//! Loads the service configuration the same way the scheduler does and
//! reports what it declares.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use redqueue::config::Config;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load and validate configuration, then list queues and schedules
    Check {
        /// Configuration file; environment variables only when absent
        #[arg(short, long, env = "REDQUEUE_CONFIG")]
        file: Option<PathBuf>,
    },
}

#[derive(Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Queue")]
    key: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Concurrency")]
    concurrency: usize,
    #[tabled(rename = "Max Attempts")]
    max_attempts: u64,
    #[tabled(rename = "Max Idle")]
    max_idle_time: String,
    #[tabled(rename = "DLQ")]
    dlq: String,
    #[tabled(rename = "Cron")]
    cron: String,
}

#[derive(Serialize, Tabled)]
struct ScheduleRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Crontab")]
    crontab: String,
}

#[derive(Serialize)]
struct ConfigSummary {
    redis_url: String,
    queues: Vec<QueueRow>,
    schedules: Vec<ScheduleRow>,
}

fn summarize(config: &Config) -> ConfigSummary {
    ConfigSummary {
        redis_url: redqueue::telemetry::redact_url(&config.redis.url),
        queues: config
            .queues
            .iter()
            .map(|(key, queue)| QueueRow {
                key: key.clone(),
                group: queue.group.clone(),
                concurrency: queue.concurrency,
                max_attempts: queue.max_attempts,
                max_idle_time: format!("{:?}", queue.max_idle_time),
                dlq: queue.dlq.clone().unwrap_or_else(|| format!("{}:dlq", key)),
                cron: queue.cron.clone().unwrap_or_else(|| "-".to_string()),
            })
            .collect(),
        schedules: config
            .schedules
            .iter()
            .map(|s| ScheduleRow {
                key: s.key.clone(),
                crontab: s.crontab.clone(),
            })
            .collect(),
    }
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Check { file } => {
            let config = match &file {
                Some(path) => Config::from_file(path)
                    .with_context(|| format!("Invalid configuration in {}", path.display()))?,
                None => Config::load().context("Invalid configuration in environment")?,
            };
            let summary = summarize(&config);

            match format {
                OutputFormat::Table => {
                    output::print_success("Configuration is valid");
                    output::print_detail("Redis", &summary.redis_url);
                    output::print_header("Queues");
                    output::print_list(&summary.queues, format)?;
                    output::print_header("Schedules");
                    output::print_list(&summary.schedules, format)?;
                }
                _ => output::print_item(&summary, format)?,
            }
        }
    }

    Ok(())
}
