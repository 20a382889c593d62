//! Connector state and statistics types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                subscribed
//! Stopped ─────────────→ Starting ─────────────→ Running ⟲ (paused while an
//!    ↑                       │                     │       endpoint is down)
//!    │                       │ refused /           │ stop()
//!    │                       │ self-loop           ↓
//!    │                       ↓                  Draining
//!    │                Failed(error) ←──────┐       │ queue empty or
//!    │                       ↑   fatal     │       │ drain deadline
//!    └───────────────────────┼─────────────┼───────┘
//!                            └── Running ──┘
//! ```
//!
//! `Failed` is "stopped with an error". Both `Stopped` and `Failed` accept
//! another `start()`.

use parking_lot::Mutex;
use serde::Serialize;

/// State of one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectorState {
    /// Not running. Initial state, and the state after a clean stop.
    Stopped,

    /// Handles acquired, waiting for the source subscription.
    Starting,

    /// Subscribed and forwarding.
    ///
    /// Stays `Running` while either endpoint is disconnected; the pump
    /// pauses instead of failing.
    Running,

    /// No longer reading the source, finishing queued messages.
    Draining,

    /// Stopped with an error.
    Failed(String),
}

impl ConnectorState {
    /// Variant name without the error detail, for metrics labels.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectorState::Stopped => "Stopped",
            ConnectorState::Starting => "Starting",
            ConnectorState::Running => "Running",
            ConnectorState::Draining => "Draining",
            ConnectorState::Failed(_) => "Failed",
        }
    }

    /// Stopped, with or without an error.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ConnectorState::Stopped | ConnectorState::Failed(_))
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Rolling per-connector statistics.
///
/// Every accepted message ends up in exactly one of `forwarded`, `failed`,
/// `suppressed` or `dropped_on_shutdown`, or is still counted in `in_flight`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectorStats {
    /// Deliveries accepted from the source.
    pub received: u64,
    pub forwarded: u64,
    /// Retries exhausted, buffer overflow, or abandoned when the connector failed.
    pub failed: u64,
    /// Echoes of this connector's own forwards.
    pub suppressed: u64,
    /// Still queued when the drain deadline elapsed.
    pub dropped_on_shutdown: u64,
    /// Publish attempts that failed and were scheduled again.
    pub retries: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Accepted and not yet settled.
    pub in_flight: u64,
    /// Times the source subscription was lost.
    pub source_disconnects: u64,
    pub last_error: Option<String>,
    /// Unix millis of the last accepted or forwarded message (0 = never).
    pub last_activity_ms: u64,
}

impl ConnectorStats {
    /// Messages accounted for as settled.
    pub fn settled(&self) -> u64 {
        self.forwarded + self.failed + self.suppressed + self.dropped_on_shutdown
    }
}

/// Statistics shared between a pump (writer) and snapshot readers.
///
/// Updates and reads take the same short lock, so a snapshot never sees
/// half of a multi-field update.
#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    inner: Mutex<ConnectorStats>,
}

impl StatsCell {
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ConnectorStats) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub(crate) fn snapshot(&self) -> ConnectorStats {
        self.inner.lock().clone()
    }
}

/// Point-in-time view of one connector.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSnapshot {
    pub name: String,
    /// `endpoint/subject`
    pub source: String,
    /// `endpoint/subject`
    pub destination: String,
    pub state: ConnectorState,
    pub stats: ConnectorStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_state_display() {
        assert_eq!(ConnectorState::Stopped.to_string(), "Stopped");
        assert_eq!(ConnectorState::Starting.to_string(), "Starting");
        assert_eq!(ConnectorState::Running.to_string(), "Running");
        assert_eq!(ConnectorState::Draining.to_string(), "Draining");
        assert_eq!(
            ConnectorState::Failed("boom".to_string()).to_string(),
            "Failed(boom)"
        );
    }

    #[test]
    fn test_connector_state_label_drops_detail() {
        assert_eq!(ConnectorState::Failed("x".to_string()).label(), "Failed");
        assert!(ConnectorState::Failed("x".to_string()).is_stopped());
        assert!(ConnectorState::Stopped.is_stopped());
        assert!(!ConnectorState::Draining.is_stopped());
    }

    #[test]
    fn test_stats_cell_update_and_snapshot() {
        let cell = StatsCell::default();
        let in_flight = cell.update(|s| {
            s.received += 2;
            s.in_flight += 2;
            s.in_flight
        });
        assert_eq!(in_flight, 2);

        cell.update(|s| {
            s.forwarded += 1;
            s.in_flight -= 1;
        });

        let snapshot = cell.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.settled() + snapshot.in_flight, snapshot.received);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = ConnectorStats {
            forwarded: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["forwarded"], 3);
        assert_eq!(json["last_error"], serde_json::Value::Null);
    }
}
