//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Endpoint connection attempts and state
//! - Per-connector message accounting
//! - Publish latency and retries
//! - Connector and replicator lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! No recorder is installed here. The embedding process picks an exporter.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Endpoint Metrics
// =============================================================================

/// Record a dial attempt.
pub fn record_connection_attempt(endpoint: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_connection_attempts_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

/// Record a connected endpoint dropping.
pub fn record_disconnect(endpoint: &str) {
    counter!("replicator_disconnects_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Gauge for endpoint connection state (0=disconnected, 1=connecting, 2=connected, 3=closing).
pub fn set_connection_state(endpoint: &str, state: &str) {
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Connected" => 2.0,
        "Closing" => 3.0,
        _ => -1.0,
    };
    gauge!("replicator_connection_state", "endpoint" => endpoint.to_string()).set(value);
}

// =============================================================================
// Connector Metrics
// =============================================================================

pub fn record_received(connector: &str, bytes: usize) {
    let name = connector.to_string();
    counter!("replicator_messages_received_total", "connector" => name.clone()).increment(1);
    counter!("replicator_bytes_received_total", "connector" => name).increment(bytes as u64);
}

pub fn record_forwarded(connector: &str, bytes: usize, latency: Duration) {
    let name = connector.to_string();
    counter!("replicator_messages_forwarded_total", "connector" => name.clone()).increment(1);
    counter!("replicator_bytes_forwarded_total", "connector" => name.clone()).increment(bytes as u64);
    histogram!("replicator_forward_latency_seconds", "connector" => name).record(latency.as_secs_f64());
}

/// Record messages that will not be forwarded, by reason.
pub fn record_failed(connector: &str, reason: &str, count: u64) {
    counter!(
        "replicator_messages_failed_total",
        "connector" => connector.to_string(),
        "reason" => reason.to_string()
    )
    .increment(count);
}

pub fn record_suppressed(connector: &str) {
    counter!("replicator_messages_suppressed_total", "connector" => connector.to_string()).increment(1);
}

pub fn record_dropped_on_shutdown(connector: &str, count: u64) {
    counter!("replicator_messages_dropped_on_shutdown_total", "connector" => connector.to_string()).increment(count);
}

pub fn record_retry(connector: &str) {
    counter!("replicator_forward_retries_total", "connector" => connector.to_string()).increment(1);
}

/// Record a single publish round trip, successful or not.
pub fn record_publish_latency(connector: &str, duration: Duration) {
    histogram!("replicator_publish_duration_seconds", "connector" => connector.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_in_flight(connector: &str, in_flight: usize) {
    gauge!("replicator_in_flight", "connector" => connector.to_string()).set(in_flight as f64);
}

/// Gauge for connector state (0=stopped, 1=starting, 2=running, 3=draining, 4=failed).
pub fn set_connector_state(connector: &str, state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Draining" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("replicator_connector_state", "connector" => connector.to_string()).set(value);
}

// =============================================================================
// Replicator Metrics
// =============================================================================

/// Gauge for replicator state.
pub fn set_replicator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_state").set(value);
}

pub fn set_connected_endpoints(count: usize) {
    gauge!("replicator_connected_endpoints").set(count as f64);
}
