// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the message replicator.
//!
//! Errors fall into the three families the replicator treats differently:
//!
//! | Family | Variants | Handling |
//! |--------|----------|----------|
//! | Configuration | `Config`, `DuplicateConnector`, `UnknownEndpoint`, `SelfLoop` | Fatal at `start()`, nothing left running |
//! | Connection | `Redis`, `Connection`, `NotConnected`, `Timeout` | Absorbed by the endpoint pool's reconnect loop |
//! | Forwarding | `Publish`, `RetriesExhausted`, `BufferOverflow` | Retried per message, then counted; fatal only under fail-fast |
//!
//! The remaining variants (`Subscribe`, `InvalidState`, `Shutdown`,
//! `Internal`) describe lifecycle misuse or a source that refused a
//! subscription outright.
//!
//! # Retry Behavior
//!
//! Use [`ReplicatorError::is_retryable()`] to decide whether an operation
//! should be attempted again after a backoff.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur while replicating messages.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Redis command or connection error.
    ///
    /// Network timeouts, dropped connections and refused dials all land here.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two connectors share a name.
    #[error("Configuration error: duplicate connector name '{0}'")]
    DuplicateConnector(String),

    /// A connector references an endpoint that is not declared.
    #[error("Configuration error: connector '{connector}' references unknown endpoint '{endpoint}'")]
    UnknownEndpoint { connector: String, endpoint: String },

    /// Source and destination resolve to the same endpoint and subject.
    #[error("Configuration error: connector '{connector}' would forward '{subject}' on endpoint '{endpoint}' back to itself")]
    SelfLoop {
        connector: String,
        endpoint: String,
        subject: String,
    },

    /// Dial failure or dropped transport.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// Operation attempted on an endpoint that is not currently connected.
    #[error("Endpoint '{endpoint}' is not connected")]
    NotConnected { endpoint: String },

    /// The destination rejected a publish.
    #[error("Publish to '{subject}' failed: {message}")]
    Publish { subject: String, message: String },

    /// The source refused a subscription.
    ///
    /// Not retryable: the endpoint answered, it just said no.
    #[error("Subscribe to '{subject}' failed: {message}")]
    Subscribe { subject: String, message: String },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A connector's pending queue is full and the source cannot be paused.
    #[error("Connector '{connector}' pending buffer full ({capacity} messages)")]
    BufferOverflow { connector: String, capacity: usize },

    /// Every attempt to forward a message failed.
    #[error("Connector '{connector}' gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        connector: String,
        attempts: u32,
        last_error: String,
    },

    /// State machine violation (e.g. starting a running replicator).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicatorError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::Connection { .. } => true,
            Self::NotConnected { .. } => true,
            Self::Publish { .. } => true,
            Self::Timeout { .. } => true,
            Self::Subscribe { .. } => false,
            Self::Config(_)
            | Self::DuplicateConnector(_)
            | Self::UnknownEndpoint { .. }
            | Self::SelfLoop { .. } => false,
            Self::BufferOverflow { .. } => false,
            Self::RetriesExhausted { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this is a configuration error (fatal at start, never retried).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::DuplicateConnector(_)
                | Self::UnknownEndpoint { .. }
                | Self::SelfLoop { .. }
        )
    }

    /// Whether the underlying connection is suspect and the pool should re-check it.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis { source: Some(e), .. } => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            Self::Redis { source: None, .. } => true,
            Self::Connection { .. } | Self::NotConnected { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<redis::RedisError> for ReplicatorError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
