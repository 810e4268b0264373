//! Redis connection for CLI commands.

use anyhow::{Context, Result};
use redqueue::store::{LogStore, RedisLogStore};
use std::sync::Arc;

const DEFAULT_URL: &str = "redis://localhost:6379";

/// Pick the Redis URL: the flag (or `REDIS_URL`), then the service
/// configuration, then localhost.
pub fn resolve_url(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| redqueue::config::Config::load().ok().map(|c| c.redis.url))
        .unwrap_or_else(|| DEFAULT_URL.to_string())
}

/// Connect and verify the server responds.
pub async fn connect(url: &str) -> Result<Arc<dyn LogStore>> {
    let store = RedisLogStore::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", redqueue::telemetry::redact_url(url)))?;
    Ok(Arc::new(store))
}
