#![allow(clippy::result_large_err)]
//! # RedQueue
//!
//! Reliable work queues on Redis Streams.
//!
//! ## Architecture
//!
//! - **Store**: stream, consumer-group and compare-and-set primitives behind
//!   the [`LogStore`](store::LogStore) trait, backed by Redis or in memory
//! - **Consumer**: claim/read/dispatch loop with retries and dead-lettering
//! - **Mutex**: token-scoped, expiring distributed locks
//! - **Crontab**: recurring triggers fired once per tick across a cluster
//! - **Registry**: named queues bound to handlers
//! - **Telemetry**: structured logging and queue counters

pub mod config;
pub mod consumer;
pub mod crontab;
pub mod error;
pub mod message;
pub mod mutex;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorSeverity, QuError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueueConfig, ScheduleConfig};
    pub use crate::consumer::{Consumer, ConsumerOptions, ConsumerState, ConsumerStats, MessageHandler};
    pub use crate::crontab::{Crontab, CrontabOptions, CrontabTrigger};
    pub use crate::error::{ErrorCode, ErrorSeverity, QuError, Result};
    pub use crate::message::{ack_messages, send_message, Message, RawMessage};
    pub use crate::mutex::{DistributedMutex, MutexOptions};
    pub use crate::registry::{Qu, QueueOptions};
    pub use crate::store::{InMemoryLogStore, LogStore, RedisLogStore, StreamId};
}
