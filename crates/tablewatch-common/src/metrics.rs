//! Metrics for TableWatch
//!
//! Thin wrappers over the `metrics` facade; the server installs a Prometheus
//! recorder, and without one every call is a no-op.
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, gauge, histogram};

// ============================================================================
// Polling Metrics
// ============================================================================

/// Record one completed poll
pub fn record_poll(entity: &str, outcome: &'static str, duration_ms: f64) {
    counter!("tablewatch_polls_total", "entity" => entity.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("tablewatch_poll_duration_ms", "entity" => entity.to_string()).record(duration_ms);
}

/// Record a failed poll
pub fn record_poll_error(entity: &str, code: &'static str) {
    counter!("tablewatch_poll_errors_total", "entity" => entity.to_string(), "code" => code)
        .increment(1);
}

/// Record change events detected by a poll or delivered by a trigger
pub fn record_events_detected(entity: &str, source: &'static str, count: usize) {
    counter!("tablewatch_events_detected_total", "entity" => entity.to_string(), "source" => source)
        .increment(count as u64);
}

/// Update the current interval of a job
pub fn set_poll_interval(entity: &str, interval_ms: u64) {
    gauge!("tablewatch_poll_interval_ms", "entity" => entity.to_string()).set(interval_ms as f64);
}

// ============================================================================
// Registry Metrics
// ============================================================================

/// Update the number of live polling jobs
pub fn set_active_jobs(count: usize) {
    gauge!("tablewatch_active_jobs").set(count as f64);
}

/// Update the number of bound channels
pub fn set_active_channels(count: usize) {
    gauge!("tablewatch_active_channels").set(count as f64);
}

/// Record a subscription attempt
pub fn record_subscription(outcome: &'static str) {
    counter!("tablewatch_subscriptions_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Transport Metrics
// ============================================================================

/// Record a message dropped from a full outbox
pub fn record_outbox_drop() {
    counter!("tablewatch_outbox_dropped_total").increment(1);
}

/// Record messages delivered to subscribers
pub fn record_messages_sent(count: u64) {
    counter!("tablewatch_messages_sent_total").increment(count);
}

/// Update the number of open connections
pub fn set_connections(count: usize) {
    gauge!("tablewatch_connections").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        record_poll("orders", "changes", 12.5);
        record_poll_error("orders", "timeout");
        record_events_detected("orders", "poll", 3);
        set_poll_interval("orders", 5_000);
        set_active_jobs(1);
        set_active_channels(2);
        record_subscription("confirmed");
        record_outbox_drop();
        record_messages_sent(4);
        set_connections(1);
    }
}
