//! In-memory log store for testing and development.
//!
//! Models the subset of Redis Streams semantics the core depends on: id
//! generation, consumer groups with a last-delivered cursor, per-group pending
//! entry lists with owner, idle time and delivery count, plus scalar keys with
//! expiry. Each operation runs under a single lock, which gives the same
//! atomicity a single-threaded Redis server would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{GroupInfo, LogStore, PendingEntry, ReadOptions, ReadStart, StreamEntry, StreamId};
use crate::error::{QuError, Result};

type Fields = HashMap<String, String>;

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: StreamId,
    consumers: BTreeSet<String>,
    pel: BTreeMap<StreamId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Debug)]
struct ValueState {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueState {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    values: HashMap<String, ValueState>,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&mut ValueState> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|v| !v.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState> {
        self.streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))
    }
}

fn no_group(stream: &str, group: &str) -> QuError {
    QuError::store(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

/// In-memory [`LogStore`].
///
/// Clones share state, so a clone stands in for another connection to the
/// same server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    shared: Arc<Shared>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(last: StreamId) -> StreamId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if now > last.ms {
            StreamId::new(now, 0)
        } else {
            StreamId::new(last.ms, last.seq + 1)
        }
    }

    /// One non-blocking attempt at a group read.
    fn try_read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        start: ReadStart,
        options: ReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.shared.state.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = stream_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;
        group_state.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let mut out = Vec::new();

        match start {
            ReadStart::NewEntries => {
                let after = group_state.last_delivered;
                for (id, fields) in entries
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .take(options.count)
                {
                    group_state.last_delivered = *id;
                    if !options.no_ack {
                        group_state.pel.insert(
                            *id,
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                delivery_count: 1,
                            },
                        );
                    }
                    out.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
            }
            ReadStart::PendingAfter(after) => {
                let owned = group_state
                    .pel
                    .range_mut((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(options.count);
                for (id, pending) in owned {
                    pending.delivery_count += 1;
                    pending.delivered_at = now;
                    out.push(StreamEntry {
                        id: *id,
                        fields: entries.get(id).cloned().unwrap_or_default(),
                    });
                }
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<StreamId> {
        let id = {
            let mut state = self.shared.state.lock();
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            let id = Self::next_id(stream_state.last_id);
            stream_state.last_id = id;
            stream_state.entries.insert(
                id,
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            id
        };
        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        create_stream: bool,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.streams.contains_key(stream) {
            if !create_stream {
                return Err(QuError::store(format!(
                    "The XGROUP subcommand requires the key '{}' to exist",
                    stream
                )));
            }
            state.streams.insert(stream.to_string(), StreamState::default());
        }

        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| QuError::internal("stream vanished under lock"))?;
        if stream_state.groups.contains_key(group) {
            return Err(QuError::group_already_exists(stream, group));
        }
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered: start,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn register_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let mut state = self.shared.state.lock();
        let group_state = state.group_mut(stream, group)?;
        Ok(group_state.consumers.insert(consumer.to_string()))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        start: ReadStart,
        options: ReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let block = match (start, options.block) {
            (ReadStart::NewEntries, Some(block)) => block,
            _ => return self.try_read_group(group, consumer, stream, start, options),
        };

        let deadline = Instant::now() + block;
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read_group(group, consumer, stream, start, options)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(entries);
            }
        }
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        from: StreamId,
        count: usize,
    ) -> Result<Vec<StreamId>> {
        let mut state = self.shared.state.lock();
        let group_state = state.group_mut(stream, group)?;
        group_state.consumers.insert(consumer.to_string());

        // Claims up to `count` idle entries, scanning at most `count * 10`.
        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, pending) in group_state
            .pel
            .range_mut(from..)
            .take(count.saturating_mul(10))
            .filter(|(_, pending)| now.saturating_duration_since(pending.delivered_at) >= min_idle)
            .take(count)
        {
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            claimed.push(*id);
        }
        Ok(claimed)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>> {
        let mut state = self.shared.state.lock();
        let group_state = state.group_mut(stream, group)?;
        group_state.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(pending) = group_state.pel.get_mut(id) {
                if now.saturating_duration_since(pending.delivered_at) >= min_idle {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min: StreamId,
        max: StreamId,
        count: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>> {
        let mut state = self.shared.state.lock();
        let group_state = state.group_mut(stream, group)?;
        if min > max {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        Ok(group_state
            .pel
            .range(min..=max)
            .filter(|(_, p)| consumer.map_or(true, |c| p.consumer == c))
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64> {
        let mut state = self.shared.state.lock();
        let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| group_state.pel.remove(*id).is_some())
            .count() as u64)
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.shared.state.lock();
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            ValueState {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_if_equal_then_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.shared.state.lock();
        match state.live_value(key) {
            Some(current) if current.value == expected => {
                current.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equal(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.shared.state.lock();
        let matches = state
            .live_value(key)
            .is_some_and(|current| current.value == expected);
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.shared.state.lock();
        Ok(state.live_value(key).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.values.insert(
            key.to_string(),
            ValueState {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.shared.state.lock();
        let value = state.live_value(key).is_some();
        state.values.remove(key);
        let stream = state.streams.remove(key).is_some();
        Ok(value || stream)
    }

    async fn range(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        let state = self.shared.state.lock();
        let Some(stream_state) = state.streams.get(stream).filter(|_| start <= end) else {
            return Ok(Vec::new());
        };
        Ok(stream_state
            .entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let state = self.shared.state.lock();
        Ok(state
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let state = self.shared.state.lock();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| QuError::store(format!("ERR no such key '{}'", stream)))?;
        Ok(stream_state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len(),
                pending: g.pel.len(),
                last_delivered_id: g.last_delivered,
            })
            .collect())
    }

    async fn isolated(&self) -> Result<Arc<dyn LogStore>> {
        Ok(Arc::new(self.clone()))
    }
}
