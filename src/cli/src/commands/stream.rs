//! Stream inspection commands.
//!
//! Provides info, pending, and range views over a stream and its groups.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use redqueue::registry::DEFAULT_GROUP;
use redqueue::store::StreamId;

use crate::connection;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum StreamCommands {
    /// Show stream length and consumer groups
    Info {
        /// Stream key
        key: String,
    },

    /// List pending (delivered but unacknowledged) entries
    Pending {
        /// Stream key
        key: String,

        /// Consumer group
        #[arg(short, long, default_value = DEFAULT_GROUP)]
        group: String,

        /// Only entries owned by this consumer
        #[arg(short, long)]
        consumer: Option<String>,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "50")]
        count: usize,
    },

    /// List entries in id order
    Range {
        /// Stream key
        key: String,

        /// First id to include
        #[arg(long, default_value = "-")]
        from: String,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
    },
}

#[derive(Serialize, Tabled)]
struct GroupRow {
    #[tabled(rename = "Group")]
    name: String,
    #[tabled(rename = "Consumers")]
    consumers: usize,
    #[tabled(rename = "Pending")]
    pending: usize,
    #[tabled(rename = "Last Delivered")]
    last_delivered_id: String,
}

#[derive(Serialize, Tabled)]
struct PendingRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Consumer")]
    consumer: String,
    #[tabled(rename = "Idle (ms)")]
    idle_ms: u128,
    #[tabled(rename = "Deliveries")]
    delivery_count: u64,
}

#[derive(Serialize, Tabled)]
struct EntryRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Producer")]
    producer: String,
    #[tabled(rename = "Payload")]
    payload: String,
}

#[derive(Serialize)]
struct StreamInfo {
    key: String,
    length: u64,
    groups: Vec<GroupRow>,
}

pub async fn execute(cmd: StreamCommands, url: &str, format: OutputFormat) -> Result<()> {
    let store = connection::connect(url).await?;

    match cmd {
        StreamCommands::Info { key } => {
            let length = store.len(&key).await?;
            let groups: Vec<GroupRow> = store
                .groups(&key)
                .await?
                .into_iter()
                .map(|g| GroupRow {
                    name: g.name,
                    consumers: g.consumers,
                    pending: g.pending,
                    last_delivered_id: g.last_delivered_id.to_string(),
                })
                .collect();

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Stream: {}", key));
                    output::print_detail("Length", &length.to_string());
                    println!();
                    output::print_list(&groups, format)?;
                }
                _ => output::print_item(&StreamInfo { key, length, groups }, format)?,
            }
        }

        StreamCommands::Pending {
            key,
            group,
            consumer,
            count,
        } => {
            let rows: Vec<PendingRow> = store
                .pending_range(
                    &key,
                    &group,
                    StreamId::MIN,
                    StreamId::MAX,
                    count,
                    consumer.as_deref(),
                )
                .await?
                .into_iter()
                .map(|p| PendingRow {
                    id: p.id.to_string(),
                    consumer: p.consumer,
                    idle_ms: p.idle.as_millis(),
                    delivery_count: p.delivery_count,
                })
                .collect();

            output::print_list(&rows, format)?;
        }

        StreamCommands::Range { key, from, count } => {
            let from: StreamId = from.parse()?;
            let rows: Vec<EntryRow> = store
                .range(&key, from, StreamId::MAX, Some(count))
                .await?
                .into_iter()
                .map(|entry| EntryRow {
                    id: entry.id.to_string(),
                    producer: entry.field("producer").unwrap_or_default().to_string(),
                    payload: output::truncate(entry.field("payload").unwrap_or_default(), 60),
                })
                .collect();

            output::print_list(&rows, format)?;
        }
    }

    Ok(())
}
