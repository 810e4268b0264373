//! Queue counters.
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the host
//! application installs a recorder; without one every call is a no-op.
//!
//! ```rust,no_run
//! use redqueue::telemetry::QueueMetrics;
//!
//! QueueMetrics::acked("orders", 1);
//! QueueMetrics::dead_lettered("orders");
//! ```

use metrics::{counter, describe_counter};

/// Register descriptions for every queue metric with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        "redqueue_messages_acked_total",
        "Messages removed from a group's pending entries"
    );
    describe_counter!(
        "redqueue_messages_failed_total",
        "Handler invocations that returned an error or panicked"
    );
    describe_counter!(
        "redqueue_messages_dead_lettered_total",
        "Messages moved to a dead-letter stream"
    );
    describe_counter!(
        "redqueue_messages_skipped_total",
        "Messages acknowledged without invoking the handler"
    );
    describe_counter!(
        "redqueue_claimed_total",
        "Idle pending entries claimed from other consumers"
    );
    describe_counter!(
        "redqueue_crontab_fired_total",
        "Crontab trigger messages appended"
    );
    describe_counter!("redqueue_errors_total", "Errors by code and category");
}

/// Per-stream message counters, labelled by `key`.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn acked(key: &str, count: u64) {
        counter!("redqueue_messages_acked_total", "key" => key.to_string()).increment(count);
    }

    pub fn failed(key: &str) {
        counter!("redqueue_messages_failed_total", "key" => key.to_string()).increment(1);
    }

    pub fn dead_lettered(key: &str) {
        counter!("redqueue_messages_dead_lettered_total", "key" => key.to_string()).increment(1);
    }

    pub fn skipped(key: &str, count: u64) {
        counter!("redqueue_messages_skipped_total", "key" => key.to_string()).increment(count);
    }

    pub fn claimed(key: &str, count: u64) {
        counter!("redqueue_claimed_total", "key" => key.to_string()).increment(count);
    }

    pub fn crontab_fired(key: &str) {
        counter!("redqueue_crontab_fired_total", "key" => key.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        QueueMetrics::acked("orders", 2);
        QueueMetrics::failed("orders");
        QueueMetrics::dead_lettered("orders");
        QueueMetrics::skipped("orders", 3);
        QueueMetrics::claimed("orders", 1);
        QueueMetrics::crontab_fired("orders");
    }
}
