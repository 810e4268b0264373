//! Redis Streams-backed log store.
//!
//! Stream and consumer-group operations map one-to-one onto `XADD`,
//! `XGROUP`, `XREADGROUP`, `XAUTOCLAIM`, `XCLAIM`, `XPENDING` and `XACK`. The
//! compare-and-set primitives used by the mutex run as Lua scripts, sent by
//! SHA first and re-sent in full when the server answers `NOSCRIPT`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::{GroupInfo, LogStore, PendingEntry, ReadOptions, ReadStart, StreamEntry, StreamId};
use crate::error::{QuError, Result};

const EXPIRE_IF_EQUAL_LUA: &str = r#"
local key = KEYS[1]
local identifier = ARGV[1]
local lock_timeout = ARGV[2]

if redis.call('get', key) == identifier then
  redis.call('pexpire', key, lock_timeout)
  return 1
end

return 0
"#;

const DEL_IF_EQUAL_LUA: &str = r#"
local key = KEYS[1]
local identifier = ARGV[1]

if redis.call('get', key) == identifier then
  return redis.call('del', key)
end

return 0
"#;

struct Scripts {
    expire_if_equal: redis::Script,
    del_if_equal: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            expire_if_equal: redis::Script::new(EXPIRE_IF_EQUAL_LUA),
            del_if_equal: redis::Script::new(DEL_IF_EQUAL_LUA),
        }
    }
}

/// Redis [`LogStore`].
///
/// Clones share one auto-reconnecting connection. [`LogStore::isolated`]
/// opens a fresh connection for callers that issue blocking reads.
#[derive(Clone)]
pub struct RedisLogStore {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisLogStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            QuError::new(
                crate::error::ErrorCode::StoreConnectionFailed,
                "Failed to create Redis client",
            )
            .with_source(e)
        })?;
        let store = Self::from_client(client).await?;
        info!(url = %crate::telemetry::redact_url(url), "Redis log store connected");
        Ok(store)
    }

    /// Build a store on an existing client, opening one connection.
    pub async fn from_client(client: redis::Client) -> Result<Self> {
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            client,
            conn,
            scripts: Arc::new(Scripts::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// `-` / `+` for the open ends of a range, the literal id otherwise.
fn range_bound(id: StreamId, open: &'static str, edge: StreamId) -> String {
    if id == edge {
        open.to_string()
    } else {
        id.to_string()
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn parse_id(value: &Value) -> Result<StreamId> {
    let raw = String::from_redis_value(value)?;
    raw.parse()
}

fn parse_fields(value: &Value) -> Result<HashMap<String, String>> {
    match value {
        Value::Nil => Ok(HashMap::new()),
        Value::Bulk(items) => {
            let mut fields = HashMap::with_capacity(items.len() / 2);
            for pair in items.chunks(2) {
                if let [k, v] = pair {
                    fields.insert(String::from_redis_value(k)?, String::from_redis_value(v)?);
                }
            }
            Ok(fields)
        }
        other => Err(QuError::unexpected_response("stream fields", format!("{:?}", other))),
    }
}

/// Entries in `[[id, [field, value, ...]], ...]` form.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => items
            .iter()
            .map(|item| match item {
                Value::Bulk(parts) if parts.len() == 2 => Ok(StreamEntry {
                    id: parse_id(&parts[0])?,
                    fields: parse_fields(&parts[1])?,
                }),
                other => Err(QuError::unexpected_response("stream entry", format!("{:?}", other))),
            })
            .collect(),
        other => Err(QuError::unexpected_response("stream entries", format!("{:?}", other))),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, entries], ...]`.
fn parse_read_reply(stream: &str, value: &Value) -> Result<Vec<StreamEntry>> {
    let streams = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(QuError::unexpected_response("XREADGROUP", format!("{:?}", other))),
    };

    for item in streams {
        if let Value::Bulk(parts) = item {
            if parts.len() == 2 && String::from_redis_value(&parts[0])? == stream {
                return parse_entries(&parts[1]);
            }
        }
    }
    Ok(Vec::new())
}

#[async_trait]
impl LogStore for RedisLogStore {
    #[instrument(level = "debug", skip(self, fields), fields(stream = %stream))]
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<StreamId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        let id: String = cmd.query_async(&mut self.conn()).await?;
        id.parse()
    }

    #[instrument(level = "debug", skip(self), fields(stream = %stream, group = %group))]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        create_stream: bool,
    ) -> Result<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start.to_string());
        if create_stream {
            cmd.arg("MKSTREAM");
        }
        let _: () = cmd.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn register_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let created: i64 = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut self.conn())
            .await?;
        Ok(created == 1)
    }

    #[instrument(level = "debug", skip(self, options), fields(stream = %stream, start = %start))]
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        start: ReadStart,
        options: ReadOptions,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(options.count);
        if let Some(block) = options.block {
            cmd.arg("BLOCK").arg(millis(block));
        }
        if options.no_ack {
            cmd.arg("NOACK");
        }
        cmd.arg("STREAMS").arg(stream).arg(start.to_string());

        let reply: Value = cmd.query_async(&mut self.conn()).await?;
        parse_read_reply(stream, &reply)
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
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg(from.to_string())
            .arg("COUNT")
            .arg(count)
            .arg("JUSTID")
            .query_async(&mut self.conn())
            .await?;

        match &reply {
            Value::Bulk(parts) if parts.len() >= 2 => match &parts[1] {
                Value::Bulk(ids) => ids.iter().map(parse_id).collect(),
                Value::Nil => Ok(Vec::new()),
                other => Err(QuError::unexpected_response("XAUTOCLAIM", format!("{:?}", other))),
            },
            other => Err(QuError::unexpected_response("XAUTOCLAIM", format!("{:?}", other))),
        }
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(millis(min_idle));
        for id in ids {
            cmd.arg(id.to_string());
        }
        cmd.arg("JUSTID");

        let claimed: Vec<String> = cmd.query_async(&mut self.conn()).await?;
        claimed.iter().map(|id| id.parse()).collect()
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
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream)
            .arg(group)
            .arg(range_bound(min, "-", StreamId::MIN))
            .arg(range_bound(max, "+", StreamId::MAX))
            .arg(count);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }

        let rows: Vec<(String, String, u64, u64)> = cmd.query_async(&mut self.conn()).await?;
        rows.into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| {
                Ok(PendingEntry {
                    id: id.parse()?,
                    consumer,
                    idle: Duration::from_millis(idle_ms),
                    delivery_count,
                })
            })
            .collect()
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let acked: u64 = cmd.query_async(&mut self.conn()).await?;
        Ok(acked)
    }

    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn set_if_equal_then_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let result: i64 = self
            .scripts
            .expire_if_equal
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(result == 1)
    }

    async fn delete_if_equal(&self, key: &str, expected: &str) -> Result<bool> {
        let result: i64 = self
            .scripts
            .del_if_equal
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(result == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn range(
        &self,
        stream: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream)
            .arg(range_bound(start, "-", StreamId::MIN))
            .arg(range_bound(end, "+", StreamId::MAX));
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let reply: Value = cmd.query_async(&mut self.conn()).await?;
        parse_entries(&reply)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let len: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let rows: Vec<HashMap<String, Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut self.conn())
            .await?;

        rows.into_iter()
            .map(|row| {
                let field = |name: &str| {
                    row.get(name)
                        .ok_or_else(|| QuError::unexpected_response("XINFO GROUPS", name))
                };
                Ok(GroupInfo {
                    name: String::from_redis_value(field("name")?)?,
                    consumers: usize::from_redis_value(field("consumers")?)?,
                    pending: usize::from_redis_value(field("pending")?)?,
                    last_delivered_id: parse_id(field("last-delivered-id")?)?,
                })
            })
            .collect()
    }

    async fn isolated(&self) -> Result<Arc<dyn LogStore>> {
        let conn = ConnectionManager::new(self.client.clone()).await?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            conn,
            scripts: Arc::clone(&self.scripts),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_range_bound_uses_open_markers() {
        assert_eq!(range_bound(StreamId::MIN, "-", StreamId::MIN), "-");
        assert_eq!(range_bound(StreamId::MAX, "+", StreamId::MAX), "+");
        assert_eq!(range_bound(StreamId::new(5, 1), "-", StreamId::MIN), "5-1");
    }

    #[test]
    fn test_parse_read_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("jobs"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("1-0"),
                    Value::Bulk(vec![data("payload"), data("{}")]),
                ]),
                Value::Bulk(vec![data("2-0"), Value::Nil]),
            ]),
        ])]);

        let entries = parse_read_reply("jobs", &reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, StreamId::new(1, 0));
        assert_eq!(entries[0].field("payload"), Some("{}"));
        assert!(entries[1].fields.is_empty());
    }

    #[test]
    fn test_parse_read_reply_timeout_is_empty() {
        assert!(parse_read_reply("jobs", &Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_parse_entries_rejects_malformed() {
        let reply = Value::Bulk(vec![Value::Int(3)]);
        assert!(parse_entries(&reply).is_err());
    }
}
