//! Message envelopes and the per-delivery message handle.
//!
//! On the wire an envelope is a stream entry with three string fields:
//! `payload` (JSON), `version` and `producer`. Dead-lettered copies add
//! `ownerKey`, `ownerGroup` and `ownerId` so the origin of every entry in a
//! dead-letter stream can be traced.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{QuError, Result};
use crate::store::{LogStore, StreamEntry, StreamId};

/// Library version stamped on produced envelopes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_PRODUCER: &str = "producer";
pub const FIELD_OWNER_KEY: &str = "ownerKey";
pub const FIELD_OWNER_GROUP: &str = "ownerGroup";
pub const FIELD_OWNER_ID: &str = "ownerId";

/// Default producer tag, `redqueue:<version>`.
pub fn default_producer() -> String {
    format!("redqueue:{}", VERSION)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Raw Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// An envelope as stored in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub payload: String,
    pub version: String,
    pub producer: String,
}

impl RawMessage {
    /// Build an envelope around the JSON encoding of `payload`.
    pub fn new<T: Serialize + ?Sized>(payload: &T) -> Result<Self> {
        Ok(Self::from_encoded(serde_json::to_string(payload)?))
    }

    /// Build an envelope around an already-encoded payload.
    pub fn from_encoded(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            version: VERSION.to_string(),
            producer: default_producer(),
        }
    }

    /// Recover an envelope from a stream entry. `None` when the entry has no
    /// payload, which happens when it was deleted while still pending.
    pub fn from_entry(entry: &StreamEntry) -> Option<Self> {
        let payload = entry.field(FIELD_PAYLOAD)?;
        Some(Self {
            payload: payload.to_string(),
            version: entry.field(FIELD_VERSION).unwrap_or_default().to_string(),
            producer: entry.field(FIELD_PRODUCER).unwrap_or_default().to_string(),
        })
    }

    pub fn fields(&self) -> [(&str, &str); 3] {
        [
            (FIELD_PAYLOAD, self.payload.as_str()),
            (FIELD_VERSION, self.version.as_str()),
            (FIELD_PRODUCER, self.producer.as_str()),
        ]
    }
}

/// Append `payload` to `key` as a new envelope.
pub async fn send_message<T: Serialize + ?Sized>(
    store: &dyn LogStore,
    key: &str,
    payload: &T,
) -> Result<StreamId> {
    let raw = RawMessage::new(payload)?;
    let id = store.append(key, &raw.fields()).await?;
    debug!(key = %key, message_id = %id, "Message sent");
    Ok(id)
}

/// Acknowledge `ids` for `group`. Returns the number actually removed from
/// the pending entry list.
pub async fn ack_messages(
    store: &dyn LogStore,
    key: &str,
    group: &str,
    ids: &[StreamId],
) -> Result<u64> {
    store.ack(key, group, ids).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivered Message
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a message was delivered: stream, group, consumer and dead-letter target.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryContext {
    pub key: String,
    pub group: String,
    pub consumer: String,
    pub dlq: String,
}

/// A message delivered to a consumer.
///
/// Cloning is cheap; clones refer to the same delivery.
#[derive(Clone)]
pub struct Message {
    id: StreamId,
    raw: RawMessage,
    retries: u64,
    context: Arc<DeliveryContext>,
    store: Arc<dyn LogStore>,
}

impl Message {
    pub(crate) fn new(
        id: StreamId,
        raw: RawMessage,
        retries: u64,
        context: Arc<DeliveryContext>,
        store: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            id,
            raw,
            retries,
            context,
            store,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Encoded payload.
    pub fn payload(&self) -> &str {
        &self.raw.payload
    }

    /// Decode the payload as JSON.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.raw.payload)?)
    }

    pub fn producer(&self) -> &str {
        &self.raw.producer
    }

    pub fn version(&self) -> &str {
        &self.raw.version
    }

    /// Number of earlier deliveries of this message.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn key(&self) -> &str {
        &self.context.key
    }

    pub fn group(&self) -> &str {
        &self.context.group
    }

    pub fn dlq(&self) -> &str {
        &self.context.dlq
    }

    /// Remove the message from the group's pending entries. Idempotent.
    pub async fn ack(&self) -> Result<()> {
        let acked = self
            .store
            .ack(&self.context.key, &self.context.group, &[self.id])
            .await?;
        if acked > 0 {
            crate::telemetry::QueueMetrics::acked(&self.context.key, acked);
        }
        Ok(())
    }

    /// Hand the message back for prompt redelivery.
    ///
    /// Ownership is re-claimed by this consumer with a zero idle threshold,
    /// which resets the idle time but keeps the delivery count, so the next
    /// backlog read delivers it again.
    pub async fn noack(&self) -> Result<()> {
        self.store
            .claim(
                &self.context.key,
                &self.context.group,
                &self.context.consumer,
                std::time::Duration::ZERO,
                &[self.id],
            )
            .await?;
        Ok(())
    }

    /// Copy the envelope to the dead-letter stream, then acknowledge it.
    ///
    /// If the copy fails the original is left pending and the error is
    /// returned.
    pub async fn move_to_dlq(&self) -> Result<()> {
        let id = self.id.to_string();
        let fields = [
            (FIELD_PAYLOAD, self.raw.payload.as_str()),
            (FIELD_VERSION, self.raw.version.as_str()),
            (FIELD_PRODUCER, self.raw.producer.as_str()),
            (FIELD_OWNER_KEY, self.context.key.as_str()),
            (FIELD_OWNER_GROUP, self.context.group.as_str()),
            (FIELD_OWNER_ID, id.as_str()),
        ];

        if let Err(e) = self.store.append(&self.context.dlq, &fields).await {
            warn!(
                key = %self.context.key,
                dlq = %self.context.dlq,
                message_id = %self.id,
                error = %e,
                "Dead-letter append failed"
            );
            return Err(QuError::dead_letter_failed(&self.context.dlq, &id, e));
        }

        self.ack().await
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("key", &self.context.key)
            .field("group", &self.context.group)
            .field("retries", &self.retries)
            .field("producer", &self.raw.producer)
            .finish()
    }
}
