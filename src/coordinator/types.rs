//! Replicator state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                            │  │
//!    │ stop()                     │  │ invalid config, or a connector
//!    │                            │  │ failed under fail-fast
//!    │                            ↓  ↓
//!    │                      Running  Failed
//!    │                            │
//!    │                     stop() │
//!    │                            ↓
//!    │                      ShuttingDown
//!    │                            │
//!    ↓                            ↓
//! Stopped ←───────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Built by `Replicator::new()`. Nothing connected.
//! - **Starting**: Validating configuration, warming endpoints, starting connectors.
//! - **Running**: Connectors started. Individual connectors may still be
//!   `Starting` (endpoint unreachable) or `Failed` (best-effort mode).
//! - **ShuttingDown**: Draining connectors.
//! - **Stopped**: Every connector stopped and every endpoint closed.
//! - **Failed**: `start()` failed. Nothing is left running.

use crate::connector::ConnectorSnapshot;
use crate::pool::EndpointStatus;
use serde::Serialize;

/// State of the replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicatorState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::Replicator::start) to begin replicating.
    Created,

    /// `start()` in progress.
    Starting,

    /// Connectors started.
    Running,

    /// `stop()` in progress.
    ShuttingDown,

    /// Stopped cleanly. Safe to drop.
    Stopped,

    /// `start()` failed. Check the returned error.
    Failed,
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Created => write!(f, "Created"),
            ReplicatorState::Starting => write!(f, "Starting"),
            ReplicatorState::Running => write!(f, "Running"),
            ReplicatorState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
            ReplicatorState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot for monitoring surfaces.
///
/// Built from cached state only.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: ReplicatorState,

    /// Running, and every connector has left `Starting`.
    pub live: bool,

    /// Live, and no connector is `Failed`.
    pub healthy: bool,

    pub connectors_total: usize,
    pub connectors_running: usize,
    pub connectors_failed: usize,
    pub endpoints_total: usize,
    pub endpoints_connected: usize,

    /// Per-connector state and statistics, sorted by name.
    pub connectors: Vec<ConnectorSnapshot>,

    /// Per-endpoint connection status, sorted by name.
    pub endpoints: Vec<EndpointStatus>,
}
