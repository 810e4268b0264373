//! Dead-letter stream commands.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use redqueue::message::{FIELD_OWNER_GROUP, FIELD_OWNER_ID, FIELD_OWNER_KEY, FIELD_PAYLOAD};
use redqueue::store::StreamId;

use crate::connection;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered messages of a queue
    List {
        /// Queue stream key
        key: String,

        /// Dead-letter stream, when not `<key>:dlq`
        #[arg(long)]
        dlq: Option<String>,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "50")]
        count: usize,
    },
}

#[derive(Serialize, Tabled)]
struct DeadRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Queue")]
    owner_key: String,
    #[tabled(rename = "Group")]
    owner_group: String,
    #[tabled(rename = "Original ID")]
    owner_id: String,
    #[tabled(rename = "Payload")]
    payload: String,
}

fn dlq_key(key: &str, dlq: Option<String>) -> String {
    dlq.unwrap_or_else(|| format!("{}:dlq", key))
}

pub async fn execute(cmd: DlqCommands, url: &str, format: OutputFormat) -> Result<()> {
    let store = connection::connect(url).await?;

    match cmd {
        DlqCommands::List { key, dlq, count } => {
            let dlq = dlq_key(&key, dlq);
            let entries = store
                .range(&dlq, StreamId::MIN, StreamId::MAX, Some(count))
                .await?;

            let rows: Vec<DeadRow> = entries
                .iter()
                .map(|entry| DeadRow {
                    id: entry.id.to_string(),
                    owner_key: entry.field(FIELD_OWNER_KEY).unwrap_or_default().to_string(),
                    owner_group: entry.field(FIELD_OWNER_GROUP).unwrap_or_default().to_string(),
                    owner_id: entry.field(FIELD_OWNER_ID).unwrap_or_default().to_string(),
                    payload: output::truncate(entry.field(FIELD_PAYLOAD).unwrap_or_default(), 60),
                })
                .collect();

            if matches!(format, OutputFormat::Table) {
                let total = store.len(&dlq).await?;
                output::print_header(&format!("Dead letters: {} ({} total)", dlq, total));
                if rows.iter().any(|row| row.owner_key != key) {
                    output::print_warning(&format!("{} also holds messages from other queues", dlq));
                }
            }
            output::print_list(&rows, format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_key() {
        assert_eq!(dlq_key("orders", None), "orders:dlq");
        assert_eq!(dlq_key("orders", Some("dead".into())), "dead");
    }
}
