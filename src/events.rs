// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed lifecycle events.
//!
//! The pool, connectors and coordinator report what happens to them as
//! [`ReplicatorEvent`]s. Every event is written to `tracing` as a structured
//! record and fanned out on a broadcast channel for embedders that want to
//! react programmatically (health surfaces, test harnesses).
//!
//! Slow receivers lag rather than block: a full channel drops the oldest
//! events for that receiver only.

use crate::connector::ConnectorState;
use crate::pool::ConnectionState;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// Why messages were counted as dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Still in flight when the drain deadline elapsed.
    Shutdown,
    /// Pending buffer full on a source that cannot be paused.
    Overflow,
    /// Left behind when the connector failed.
    ConnectorFailed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Shutdown => write!(f, "shutdown"),
            DropReason::Overflow => write!(f, "overflow"),
            DropReason::ConnectorFailed => write!(f, "connector_failed"),
        }
    }
}

/// Something observable happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicatorEvent {
    ConnectionStateChanged {
        endpoint: String,
        state: ConnectionState,
    },
    /// A dial attempt failed; the next one is scheduled.
    ConnectionFailed {
        endpoint: String,
        attempt: u32,
        error: String,
        retry_in: Duration,
    },
    ConnectorStateChanged {
        connector: String,
        state: ConnectorState,
    },
    /// A message exhausted its retries.
    ForwardFailed {
        connector: String,
        subject: String,
        attempts: u32,
        error: String,
    },
    MessagesDropped {
        connector: String,
        count: u64,
        reason: DropReason,
    },
}

/// Broadcast fan-out plus structured logging for [`ReplicatorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReplicatorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.tx.subscribe()
    }

    /// Log the event and hand it to every current receiver.
    pub fn emit(&self, event: ReplicatorEvent) {
        log_event(&event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &ReplicatorEvent) {
    match event {
        ReplicatorEvent::ConnectionStateChanged { endpoint, state } => match state {
            ConnectionState::Connected => info!(endpoint = %endpoint, state = %state, "Endpoint connected"),
            ConnectionState::Disconnected => warn!(endpoint = %endpoint, state = %state, "Endpoint disconnected"),
            _ => debug!(endpoint = %endpoint, state = %state, "Endpoint state changed"),
        },
        ReplicatorEvent::ConnectionFailed {
            endpoint,
            attempt,
            error,
            retry_in,
        } => {
            warn!(
                endpoint = %endpoint,
                attempt,
                error = %error,
                retry_in_ms = retry_in.as_millis() as u64,
                "Endpoint dial failed, retrying"
            );
        }
        ReplicatorEvent::ConnectorStateChanged { connector, state } => match state {
            ConnectorState::Failed(reason) => {
                error!(connector = %connector, error = %reason, "Connector stopped with error")
            }
            _ => info!(connector = %connector, state = %state, "Connector state changed"),
        },
        ReplicatorEvent::ForwardFailed {
            connector,
            subject,
            attempts,
            error,
        } => {
            warn!(
                connector = %connector,
                subject = %subject,
                attempts,
                error = %error,
                "Message forward failed"
            );
        }
        ReplicatorEvent::MessagesDropped { connector, count, reason } => {
            warn!(connector = %connector, count, reason = %reason, "Messages dropped");
        }
    }
}
