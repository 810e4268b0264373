//! RedQueue scheduler daemon.
//!
//! Runs every configured crontab (standalone `schedules` plus queues with a
//! `cron` option) until Ctrl-C or SIGTERM. Any number of replicas may run;
//! each tick still fires once.

use std::sync::Arc;

use redqueue::{
    config::Config,
    crontab::Crontab,
    registry::shutdown_signal,
    store::{LogStore, RedisLogStore},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match std::env::var("REDQUEUE_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    telemetry::init(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        schedules = config.schedules.len(),
        "Starting RedQueue scheduler"
    );

    let store: Arc<dyn LogStore> = Arc::new(RedisLogStore::connect(&config.redis.url).await?);

    let mut crontabs = Vec::new();
    for schedule in &config.schedules {
        crontabs.push(Crontab::new(Arc::clone(&store), schedule.key.as_str(), &schedule.crontab)?);
    }
    for (key, queue) in &config.queues {
        if let Some(cron) = &queue.cron {
            crontabs.push(Crontab::new(Arc::clone(&store), key.as_str(), cron)?);
        }
    }

    if crontabs.is_empty() {
        tracing::warn!("No schedules configured, nothing to do");
        return Ok(());
    }

    for crontab in &crontabs {
        crontab.start()?;
    }

    shutdown_signal().await;

    for crontab in &crontabs {
        if let Err(e) = crontab.stop().await {
            tracing::error!(key = %crontab.key(), error = %e, "Crontab stopped with error");
        }
    }

    tracing::info!("Scheduler shutdown complete");
    Ok(())
}
