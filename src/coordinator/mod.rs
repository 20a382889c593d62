// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator lifecycle orchestration.
//!
//! The [`Replicator`] owns everything that lives for the whole process:
//! - The shared [`EndpointPool`] (one supervised connection per cluster)
//! - The [`ConnectorRegistry`] (one [`Connector`] per configured path)
//! - The [`EventBus`] every component reports through
//!
//! # Lifecycle
//!
//! 1. `start()` validates the configuration, warms one pool entry per
//!    referenced endpoint, builds and registers every connector, then starts
//!    them all concurrently
//! 2. Connectors forward independently; endpoint outages pause them
//! 3. `stop()` drains every connector concurrently under the global
//!    shutdown deadline, then closes the pool
//!
//! `start()` and `stop()` are serialized by a lifecycle lock, so a `stop()`
//! racing a `start()` waits for it and then tears down whatever it built.

mod types;

pub use types::{HealthCheck, ReplicatorState};

use crate::config::{FailurePolicy, ReplicatorConfig};
use crate::connector::{Connector, ConnectorSnapshot, ConnectorState};
use crate::error::{ReplicatorError, Result};
use crate::events::{EventBus, ReplicatorEvent};
use crate::metrics;
use crate::pool::{ConnectionState, EndpointHandle, EndpointPool};
use crate::registry::ConnectorRegistry;
use crate::transport::redis::RedisDialer;
use crate::transport::Dialer;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The message replicator.
///
/// Bridges messages between clusters along the configured connectors.
///
/// # Example
///
/// ```rust,no_run
/// use message_replicator::{Replicator, ReplicatorConfig};
///
/// # async fn example(config: ReplicatorConfig) -> message_replicator::Result<()> {
/// let replicator = Replicator::new(config);
/// replicator.start().await?;
///
/// // ... until the process is asked to exit
///
/// replicator.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Replicator {
    /// Immutable once handed over.
    config: ReplicatorConfig,

    /// Replicator state (broadcast to watchers)
    state_tx: watch::Sender<ReplicatorState>,

    /// Replicator state receiver (for internal use)
    state_rx: watch::Receiver<ReplicatorState>,

    pool: Arc<EndpointPool>,

    registry: ConnectorRegistry,

    events: EventBus,

    /// Serializes `start()` and `stop()`.
    lifecycle: Mutex<()>,

    /// One handle per referenced endpoint, held so dialing begins before
    /// any connector starts.
    warm: parking_lot::Mutex<Vec<EndpointHandle>>,
}

impl Replicator {
    /// Create a replicator that talks to Redis.
    ///
    /// The replicator starts in `Created` state. Nothing is dialed until
    /// [`start()`](Self::start).
    pub fn new(config: ReplicatorConfig) -> Self {
        Self::with_dialer(config, Arc::new(RedisDialer::new()))
    }

    /// Create a replicator with a custom dialer (e.g. the in-memory one).
    pub fn with_dialer(config: ReplicatorConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Created);
        let events = EventBus::default();
        let pool = Arc::new(EndpointPool::new(
            dialer,
            config.settings.reconnect.clone(),
            events.clone(),
        ));

        Self {
            config,
            state_tx,
            state_rx,
            pool,
            registry: ConnectorRegistry::new(),
            events,
            lifecycle: Mutex::new(()),
            warm: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Get current replicator state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReplicatorState::Running)
    }

    /// Running, and every connector has left `Starting`.
    pub fn is_live(&self) -> bool {
        self.is_running()
            && self
                .registry
                .all()
                .iter()
                .all(|c| c.state() != ConnectorState::Starting)
    }

    /// The registered connectors. Empty before `start()`.
    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn connector(&self, name: &str) -> Option<Arc<Connector>> {
        self.registry.get(name)
    }

    /// Point-in-time state and statistics of every connector, sorted by name.
    pub fn snapshot(&self) -> Vec<ConnectorSnapshot> {
        self.registry.snapshot()
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Receive every [`ReplicatorEvent`] emitted from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.events.subscribe()
    }

    /// Get comprehensive health status for monitoring endpoints.
    ///
    /// **Performance**: This method performs no network I/O. All data is
    /// collected from cached internal state (watch channels, short locks).
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = replicator.health_check();
    ///
    /// // For /ready endpoint
    /// if health.live {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    ///
    /// // For /health endpoint (full diagnostics)
    /// HttpResponse::Ok().json(&health)
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let connectors = self.registry.snapshot();
        let endpoints = self.pool.status();

        let connectors_running = connectors
            .iter()
            .filter(|c| c.state == ConnectorState::Running)
            .count();
        let connectors_failed = connectors
            .iter()
            .filter(|c| matches!(c.state, ConnectorState::Failed(_)))
            .count();
        let any_starting = connectors.iter().any(|c| c.state == ConnectorState::Starting);
        let endpoints_connected = endpoints
            .iter()
            .filter(|e| e.state == ConnectionState::Connected)
            .count();

        let live = state == ReplicatorState::Running && !any_starting;
        let healthy = live && connectors_failed == 0;

        HealthCheck {
            state,
            live,
            healthy,
            connectors_total: connectors.len(),
            connectors_running,
            connectors_failed,
            endpoints_total: endpoints.len(),
            endpoints_connected,
            connectors,
            endpoints,
        }
    }

    /// Start replicating.
    ///
    /// 1. Validates the whole configuration (nothing is dialed on error)
    /// 2. Warms one pool connection per referenced endpoint
    /// 3. Builds and registers every connector in declared order
    /// 4. Starts all connectors concurrently
    ///
    /// A connector that fails to start is fatal under the global fail-fast
    /// policy: everything started so far is stopped and the first error in
    /// declared order is returned. Under best-effort it is logged and the
    /// rest keep serving.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() != ReplicatorState::Created {
            return Err(ReplicatorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            endpoints = self.config.endpoints.len(),
            connectors = self.config.connectors.len(),
            failure_policy = ?self.config.settings.failure_policy,
            "Starting replicator"
        );
        self.set_state(ReplicatorState::Starting);

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid replicator configuration");
            self.set_state(ReplicatorState::Failed);
            return Err(e);
        }

        let connectors = match self.build() {
            Ok(connectors) => connectors,
            Err(e) => {
                error!(error = %e, "Failed to build connectors");
                self.teardown().await;
                self.set_state(ReplicatorState::Failed);
                return Err(e);
            }
        };

        let results = join_all(connectors.iter().map(|c| c.start())).await;

        let fail_fast = self.config.settings.failure_policy == FailurePolicy::FailFast;
        let mut failed = 0;
        for (connector, result) in connectors.iter().zip(results) {
            let Err(e) = result else { continue };
            failed += 1;

            if fail_fast {
                error!(
                    connector = %connector.name(),
                    error = %e,
                    "Connector failed to start, stopping replicator"
                );
                self.teardown().await;
                self.set_state(ReplicatorState::Failed);
                return Err(e);
            }

            error!(
                connector = %connector.name(),
                error = %e,
                "Connector failed to start, continuing with the rest"
            );
        }

        self.set_state(ReplicatorState::Running);
        metrics::set_connected_endpoints(self.pool.connected_count());
        info!(
            started = connectors.len() - failed,
            failed,
            endpoints = self.pool.len(),
            "Replicator running"
        );

        Ok(())
    }

    /// Acquire one pool handle per referenced endpoint and register every
    /// connector. Returns connectors in declared order.
    fn build(&self) -> Result<Vec<Arc<Connector>>> {
        let mut referenced = HashSet::new();
        for connector in &self.config.connectors {
            referenced.insert(connector.source.endpoint.as_str());
            referenced.insert(connector.destination.endpoint.as_str());
        }

        {
            let mut warm = self.warm.lock();
            for endpoint in self.config.endpoints.iter().filter(|e| referenced.contains(e.name.as_str())) {
                warm.push(self.pool.acquire(endpoint)?);
            }
        }
        debug!(
            referenced = referenced.len(),
            connections = self.pool.len(),
            "Endpoint pool warmed"
        );

        let mut connectors = Vec::with_capacity(self.config.connectors.len());
        for connector_config in &self.config.connectors {
            let connector = Arc::new(Connector::from_config(
                &self.config,
                connector_config,
                Arc::clone(&self.pool),
                self.events.clone(),
            )?);
            self.registry.register(Arc::clone(&connector))?;
            connectors.push(connector);
        }

        Ok(connectors)
    }

    /// Stop replicating.
    ///
    /// Drains every connector concurrently, bounded by the shutdown
    /// deadline, then closes every pooled connection. Idempotent: stopping
    /// a stopped replicator does nothing.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ReplicatorState::Stopped => {
                debug!("Replicator already stopped");
                return;
            }
            ReplicatorState::Created => {
                self.set_state(ReplicatorState::Stopped);
                info!("Replicator stopped before start");
                return;
            }
            _ => {}
        }

        info!(connectors = self.registry.len(), "Stopping replicator");
        self.set_state(ReplicatorState::ShuttingDown);

        self.teardown().await;

        self.set_state(ReplicatorState::Stopped);
        info!("Replicator stopped");
    }

    /// Stop every registered connector, then close the pool. Idempotent.
    async fn teardown(&self) {
        let connectors = self.registry.all();
        let deadline = self.config.settings.shutdown.shutdown_timeout_duration();

        if !connectors.is_empty() {
            let stopped = timeout(deadline, join_all(connectors.iter().map(|c| c.stop()))).await;
            if stopped.is_err() {
                warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "Shutdown deadline elapsed before every connector stopped"
                );
            }
        }

        let (forwarded, failed, dropped) = self.registry.snapshot().iter().fold((0, 0, 0), |acc, s| {
            (
                acc.0 + s.stats.forwarded,
                acc.1 + s.stats.failed,
                acc.2 + s.stats.dropped_on_shutdown,
            )
        });
        if dropped > 0 {
            warn!(dropped, "Messages dropped on shutdown");
        }
        info!(
            connectors = connectors.len(),
            forwarded,
            failed,
            dropped,
            "Connectors stopped"
        );

        self.warm.lock().clear();
        self.pool
            .close_all(self.config.settings.reconnect.dial_timeout_duration())
            .await;
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_replicator_state(&state.to_string());
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("state", &self.state())
            .field("connectors", &self.registry.len())
            .field("endpoints", &self.pool.len())
            .finish()
    }
}
