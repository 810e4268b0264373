//! Crontab inspection commands.
//!
//! `next` works offline; `status` reads the crontab's keys from Redis.

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone, Utc};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use redqueue::crontab::parse_schedule;

use crate::connection;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum CrontabCommands {
    /// Show the upcoming fire times of an expression
    Next {
        /// Cron expression (five, six or seven fields)
        expression: String,

        /// Number of fire times to show
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Show the stored state of a running crontab
    Status {
        /// Stream key the crontab fires into
        key: String,
    },
}

#[derive(Serialize, Tabled)]
struct FireRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "UTC")]
    utc: String,
    #[tabled(rename = "Local")]
    local: String,
}

#[derive(Serialize)]
struct CrontabStatus {
    key: String,
    next_fire: Option<DateTime<Utc>>,
    lock_holder: Option<String>,
    triggers: u64,
}

fn upcoming(expression: &str, count: usize) -> Result<Vec<DateTime<Utc>>> {
    let schedule = parse_schedule(expression)?;
    Ok(schedule.upcoming(Utc).take(count).collect())
}

pub async fn execute(cmd: CrontabCommands, url: &str, format: OutputFormat) -> Result<()> {
    match cmd {
        CrontabCommands::Next { expression, count } => {
            let rows: Vec<FireRow> = upcoming(&expression, count)?
                .into_iter()
                .enumerate()
                .map(|(i, at)| FireRow {
                    index: i + 1,
                    utc: at.to_rfc3339(),
                    local: at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
                })
                .collect();
            output::print_list(&rows, format)?;
        }

        CrontabCommands::Status { key } => {
            let store = connection::connect(url).await?;
            let next_fire = store
                .get(&format!("{}:next", key))
                .await?
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            let lock_holder = store.get(&format!("{}:lock", key)).await?;
            let triggers = store.len(&key).await?;

            let status = CrontabStatus {
                key,
                next_fire,
                lock_holder,
                triggers,
            };

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Crontab: {}", status.key));
                    output::print_detail(
                        "Next fire",
                        &status
                            .next_fire
                            .map_or_else(|| "not seeded".to_string(), |at| at.to_rfc3339()),
                    );
                    output::print_detail(
                        "Lock holder",
                        status.lock_holder.as_deref().unwrap_or("none"),
                    );
                    output::print_detail("Trigger messages", &status.triggers.to_string());
                    if status.lock_holder.is_none() {
                        output::print_warning("No process currently holds the crontab lock");
                    }
                }
                _ => output::print_item(&status, format)?,
            }
        }
    }

    Ok(())
}
