//! Log store abstraction.
//!
//! The consumer, mutex and crontab never talk to Redis directly. They go
//! through [`LogStore`], which exposes the handful of stream, consumer-group
//! and compare-and-set primitives they need. Two backends are provided:
//!
//! - [`RedisLogStore`]: Redis Streams plus server-side Lua scripts
//! - [`InMemoryLogStore`]: an in-process model of the same semantics for
//!   tests and development
//!
//! Every atomicity guarantee the core relies on (group creation, claim,
//! acknowledge, compare-and-set with expiry) is provided by the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QuError, Result};

mod memory;
mod redis_backend;

pub use self::memory::InMemoryLogStore;
pub use self::redis_backend::RedisLogStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Stream Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Store-assigned entry identifier, `<milliseconds>-<sequence>`.
///
/// Identifiers are totally ordered within a stream; ordering is numeric on
/// both parts, so `5-10` sorts after `5-9`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest identifier, `0-0`.
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    /// The largest identifier.
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Identifier whose millisecond part is the given Unix timestamp.
    pub fn from_millis(ms: u64) -> Self {
        Self { ms, seq: 0 }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = QuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "-" => return Ok(Self::MIN),
            "+" => return Ok(Self::MAX),
            _ => {}
        }

        let invalid = || QuError::configuration(format!("invalid stream id '{}'", s));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Types
// ═══════════════════════════════════════════════════════════════════════════════

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    /// Field/value pairs. Empty when the entry was deleted while still pending.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A claimed-but-unacknowledged entry in a group's pending entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: StreamId,
    /// Name of the consumer currently owning the entry.
    pub consumer: String,
    /// Time since the entry was last delivered to (or claimed by) its owner.
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStart {
    /// Entries never delivered to any group member (`>`).
    NewEntries,
    /// This consumer's own pending entries with an id greater than the given one.
    PendingAfter(StreamId),
}

impl fmt::Display for ReadStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewEntries => f.write_str(">"),
            Self::PendingAfter(id) => write!(f, "{}", id),
        }
    }
}

/// Options for a group read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum entries returned.
    pub count: usize,
    /// How long to wait for new entries. Ignored when replaying pending entries.
    pub block: Option<Duration>,
    /// Deliver without adding entries to the pending entry list.
    pub no_ack: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            count: 1,
            block: None,
            no_ack: false,
        }
    }
}

/// Summary of one consumer group on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: StreamId,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Primitives the core needs from the underlying log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry with a store-generated id.
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<StreamId>;

    /// Create a consumer group. Fails with `GroupAlreadyExists` when the
    /// group is already there.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        create_stream: bool,
    ) -> Result<()>;

    /// Register a consumer name within a group. Returns `true` if it was new.
    async fn register_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool>;

    /// Read entries as a group member.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        start: ReadStart,
        options: ReadOptions,
    ) -> Result<Vec<StreamEntry>>;

    /// Transfer ownership of pending entries idle for at least `min_idle`,
    /// scanning from `from`. Delivery counts are left untouched.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        from: StreamId,
        count: usize,
    ) -> Result<Vec<StreamId>>;

    /// Transfer ownership of specific pending entries idle for at least
    /// `min_idle`, resetting their idle time. Delivery counts are left untouched.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>>;

    /// Inspect the pending entry list, optionally restricted to one consumer.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min: StreamId,
        max: StreamId,
        count: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>>;

    /// Acknowledge entries, removing them from the pending entry list.
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64>;

    /// `SET key value NX PX ttl`.
    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically extend the expiry of `key` only while it still holds `expected`.
    async fn set_if_equal_then_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Atomically delete `key` only while it still holds `expected`.
    async fn delete_if_equal(&self, key: &str, expected: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key of any type. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Entries between `start` and `end` inclusive.
    async fn range(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>>;

    /// Number of entries in a stream, zero if it does not exist.
    async fn len(&self, stream: &str) -> Result<u64>;

    /// Consumer groups registered on a stream.
    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// A handle backed by its own dedicated connection, so blocking reads
    /// issued through it never stall callers of `self`.
    async fn isolated(&self) -> Result<Arc<dyn LogStore>>;
}
