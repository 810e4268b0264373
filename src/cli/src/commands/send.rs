//! Send command.
//!
//! Appends a message to a stream in the same format the library produces.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_json::Value;

use crate::connection;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct SendArgs {
    /// Stream key
    key: String,

    /// Payload as JSON; anything that does not parse is sent as a string
    payload: String,

    /// Number of copies to send
    #[arg(short, long, default_value = "1")]
    repeat: u32,
}

#[derive(Serialize)]
struct SendResult {
    key: String,
    ids: Vec<String>,
}

/// JSON payloads are sent as-is, anything else as a JSON string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn execute(args: SendArgs, url: &str, format: OutputFormat) -> Result<()> {
    let store = connection::connect(url).await?;
    let payload = parse_payload(&args.payload);

    let mut ids = Vec::with_capacity(args.repeat as usize);
    for _ in 0..args.repeat {
        let id = redqueue::message::send_message(store.as_ref(), &args.key, &payload).await?;
        ids.push(id.to_string());
    }

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Sent {} message(s) to {}", ids.len(), args.key));
            for id in &ids {
                output::print_detail("ID", id);
            }
        }
        _ => output::print_item(&SendResult { key: args.key, ids }, format)?,
    }

    Ok(())
}
