// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connectors: one supervised source to destination forwarding path each.
//!
//! A [`Connector`] owns its configuration, its statistics and, while
//! running, one pump task (see [`pump`]). It never dials anything itself;
//! both endpoints come from the shared [`EndpointPool`].
//!
//! # Example
//!
//! ```rust,no_run
//! # use message_replicator::connector::Connector;
//! # async fn example(connector: Connector) -> message_replicator::Result<()> {
//! connector.start().await?;
//! let snapshot = connector.snapshot();
//! println!("{} forwarded {}", snapshot.name, snapshot.stats.forwarded);
//! connector.stop().await;
//! # Ok(())
//! # }
//! ```

mod pump;
mod types;

pub use types::{ConnectorSnapshot, ConnectorState, ConnectorStats};

use crate::config::{
    check_self_loop, ConnectorConfig, EndpointConfig, FailurePolicy, ReplicatorConfig, ReplicatorSettings,
};
use crate::error::{ReplicatorError, Result};
use crate::events::{DropReason, EventBus, ReplicatorEvent};
use crate::metrics;
use crate::pool::EndpointPool;
use crate::resilience::RateLimiter;
use crate::transport::SubscribeRequest;
use pump::{Pump, PumpSettings, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn, Instrument};

/// Extra time `stop()` gives the pump beyond the drain deadline before aborting it.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// A running pump and the signal that stops it.
struct PumpTask {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// One forwarding path.
pub struct Connector {
    config: ConnectorConfig,
    source_endpoint: EndpointConfig,
    destination_endpoint: EndpointConfig,
    settings: ReplicatorSettings,
    pool: Arc<EndpointPool>,
    shared: Arc<Shared>,
    task: Mutex<Option<PumpTask>>,
}

impl Connector {
    /// Build a connector. Performs no I/O.
    pub fn new(
        config: ConnectorConfig,
        source_endpoint: EndpointConfig,
        destination_endpoint: EndpointConfig,
        settings: ReplicatorSettings,
        pool: Arc<EndpointPool>,
        events: EventBus,
    ) -> Self {
        let shared = Arc::new(Shared::new(&config.name, events));
        metrics::set_connector_state(&config.name, ConnectorState::Stopped.label());
        Self {
            config,
            source_endpoint,
            destination_endpoint,
            settings,
            pool,
            shared,
            task: Mutex::new(None),
        }
    }

    /// Build the connector named by `connector`, resolving its endpoints in `config`.
    pub fn from_config(
        config: &ReplicatorConfig,
        connector: &ConnectorConfig,
        pool: Arc<EndpointPool>,
        events: EventBus,
    ) -> Result<Self> {
        let resolve = |endpoint: &str| {
            config
                .endpoint(endpoint)
                .cloned()
                .ok_or_else(|| ReplicatorError::UnknownEndpoint {
                    connector: connector.name.clone(),
                    endpoint: endpoint.to_string(),
                })
        };
        let source = resolve(&connector.source.endpoint)?;
        let destination = resolve(&connector.destination.endpoint)?;
        Ok(Self::new(
            connector.clone(),
            source,
            destination,
            config.settings.clone(),
            pool,
            events,
        ))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.state()
    }

    /// Receiver for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectorStats {
        self.shared.stats.snapshot()
    }

    /// Failure policy after applying the per-connector override.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.config.effective_policy(self.settings.failure_policy)
    }

    /// Point-in-time copy of state and statistics. Never waits on the pump.
    pub fn snapshot(&self) -> ConnectorSnapshot {
        ConnectorSnapshot {
            name: self.config.name.clone(),
            source: format!("{}/{}", self.source_endpoint.name, self.config.source.subject),
            destination: format!("{}/{}", self.destination_endpoint.name, self.config.destination.subject),
            state: self.shared.state(),
            stats: self.shared.stats.snapshot(),
        }
    }

    /// Start forwarding.
    ///
    /// Returns once the connector is `Running`, or with the error that put
    /// it in `Failed`. If the source endpoint is still unreachable when the
    /// start timeout elapses, returns `Ok` with the connector left in
    /// `Starting`; it moves to `Running` on its own once the source is up.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;

        let current = self.shared.state();
        if !current.is_stopped() {
            return Err(ReplicatorError::InvalidState {
                expected: "Stopped".to_string(),
                actual: current.to_string(),
            });
        }

        // Reap the previous run, which has already finished
        if let Some(previous) = task.take() {
            previous.handle.abort();
        }
        self.shared.fatal.lock().take();

        if let Err(e) = check_self_loop(&self.config, &self.source_endpoint, &self.destination_endpoint) {
            self.shared.set_state(ConnectorState::Failed(e.to_string()));
            return Err(e);
        }

        let source = self.pool.acquire(&self.source_endpoint)?;
        let destination = self.pool.acquire(&self.destination_endpoint)?;

        let forward = &self.settings.forward;
        let settings = PumpSettings {
            request: SubscribeRequest {
                subject: self.config.source.subject.clone(),
                group: self.config.consumer_group(),
                consumer: self
                    .source_endpoint
                    .client_id
                    .clone()
                    .unwrap_or_else(|| self.config.name.clone()),
                start: self.config.source.start_position.clone(),
                capacity: forward.max_pending.max(1),
            },
            destination_subject: self.config.destination.subject.clone(),
            echo_suppression: !self.config.no_echo_suppression,
            policy: self.failure_policy(),
            max_retries: forward.max_retries,
            retry_backoff: forward.retry_backoff(),
            resubscribe_backoff: self.settings.reconnect.backoff(),
            publish_timeout: forward.publish_timeout_duration(),
            max_pending: forward.max_pending.max(1),
            drain_timeout: self.settings.shutdown.drain_timeout_duration(),
            rate_limiter: forward.rate_limit_config().map(RateLimiter::new),
        };

        self.shared.set_state(ConnectorState::Starting);
        let mut state_rx = self.shared.state_tx.subscribe();

        let (stop_tx, stop_rx) = watch::channel(false);
        let pump = Pump::new(Arc::clone(&self.shared), source, destination, settings, stop_rx);
        let span = tracing::info_span!("connector", connector = %self.config.name);
        let handle = tokio::spawn(pump.run().instrument(span));
        *task = Some(PumpTask { handle, stop_tx });
        drop(task);

        let start_timeout = self.settings.start_timeout_duration();
        let settled = timeout(
            start_timeout,
            state_rx.wait_for(|s| *s != ConnectorState::Starting),
        )
        .await
        .map(|r| r.map(|state| (*state).clone()));

        match settled {
            Ok(Ok(ConnectorState::Failed(reason))) => Err(self
                .shared
                .fatal
                .lock()
                .take()
                .unwrap_or(ReplicatorError::Internal(reason))),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ReplicatorError::Internal("connector state channel closed".to_string())),
            Err(_) => {
                warn!(
                    connector = %self.config.name,
                    source = %self.source_endpoint.name,
                    timeout_ms = start_timeout.as_millis() as u64,
                    "Source not reachable yet, connector stays Starting"
                );
                Ok(())
            }
        }
    }

    /// Stop forwarding, draining queued messages up to the drain deadline.
    ///
    /// Idempotent. A connector that already failed keeps its `Failed` state.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(PumpTask { mut handle, stop_tx }) = task.take() else {
            return;
        };

        stop_tx.send_replace(true);
        let limit = self.settings.shutdown.drain_timeout_duration() + STOP_GRACE;

        match timeout(limit, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(connector = %self.config.name, error = %e, "Connector pump panicked");
                self.shared.set_state(ConnectorState::Failed(format!("pump panicked: {}", e)));
            }
            Err(_) => {
                handle.abort();
                let lost = self.shared.stats.update(|s| {
                    let lost = s.in_flight;
                    s.dropped_on_shutdown += lost;
                    s.in_flight = 0;
                    lost
                });
                warn!(connector = %self.config.name, lost, "Pump did not drain in time, aborted");
                if lost > 0 {
                    metrics::record_dropped_on_shutdown(&self.config.name, lost);
                    self.shared.events.emit(ReplicatorEvent::MessagesDropped {
                        connector: self.config.name.clone(),
                        count: lost,
                        reason: DropReason::Shutdown,
                    });
                }
                self.shared.set_state(ConnectorState::Stopped);
            }
        }

        info!(connector = %self.config.name, state = %self.shared.state(), "Connector stopped");
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.config.name)
            .field("state", &self.shared.state())
            .finish()
    }
}
