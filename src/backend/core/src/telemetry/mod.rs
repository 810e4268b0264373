//! Telemetry: logging and metrics.
//!
//! - **Logging**: `tracing` subscriber with JSON/pretty/compact output
//! - **Metrics**: per-stream counters through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use redqueue::telemetry::{init, LoggingConfig};
//!
//! init(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact_url, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, QueueMetrics};

/// Install logging and register metric descriptions.
///
/// Call once at startup. Library users that install their own subscriber
/// should skip this.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    describe_metrics();
    ::tracing::debug!(format = ?config.format, level = %config.level, "Telemetry initialized");
    Ok(())
}
