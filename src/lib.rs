//! # Message Replicator
//!
//! Bridges messages between independently operated clusters: fire-and-forget
//! pub/sub subjects and durable streams with consumer groups.
//!
//! ## Architecture
//!
//! Each configured connector forwards one source subject to one destination
//! subject. Connectors share pooled, supervised endpoint connections and
//! otherwise run fully independently:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Replicator                                   │
//! │                                                                           │
//! │  ┌──────────────┐   acquire   ┌────────────────────────────────────────┐  │
//! │  │ EndpointPool │◄────────────│ ConnectorRegistry                      │  │
//! │  │ (1 conn per  │             │  ┌───────────┐  ┌───────────┐          │  │
//! │  │  identity,   │             │  │ Connector │  │ Connector │  ...     │  │
//! │  │  reconnects) │             │  │  (pump)   │  │  (pump)   │          │  │
//! │  └──────┬───────┘             │  └───────────┘  └───────────┘          │  │
//! │         │                     └────────────────────────────────────────┘  │
//! └─────────┼─────────────────────────────────────────────────────────────────┘
//!           ▼
//!   Redis Pub/Sub (CorePubSub)    Redis Streams + groups (DurableStream)
//! ```
//!
//! ## Delivery
//!
//! - Per-connector order is preserved: only the head of a connector's queue
//!   is ever published, retries included
//! - Every accepted message is counted as forwarded, failed, suppressed or
//!   dropped on shutdown
//! - Durable sources are acknowledged only after the forward settles
//! - Endpoint outages pause connectors; they never fail them
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_replicator::{Replicator, ReplicatorConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicatorConfig::default();
//!
//!     let replicator = Replicator::new(config);
//!     replicator.start().await.expect("Failed to start");
//!
//!     // Replicator runs until shutdown signal
//!     replicator.stop().await;
//! }
//! ```

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod transport;

// Re-exports for convenience
pub use config::{ConnectorConfig, EndpointConfig, EndpointKind, FailurePolicy, ReplicatorConfig, ReplicatorSettings};
pub use connector::{Connector, ConnectorSnapshot, ConnectorState, ConnectorStats};
pub use coordinator::{HealthCheck, Replicator, ReplicatorState};
pub use error::{ReplicatorError, Result};
pub use events::{DropReason, EventBus, ReplicatorEvent};
pub use pool::{ConnectionState, EndpointHandle, EndpointPool, EndpointStatus};
pub use registry::ConnectorRegistry;
