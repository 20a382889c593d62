//! Endpoint pool: one supervised connection per distinct cluster.
//!
//! Connectors never dial. They [`acquire`](EndpointPool::acquire) a handle
//! for an endpoint and the pool either returns the existing connection for
//! that [`EndpointIdentity`] or creates it and starts its supervisor task.
//!
//! # Connection Lifecycle
//!
//! ```text
//!                dial ok
//! Connecting ────────────→ Connected
//!     ↑   │                    │
//!     │   │ dial failed        │ ping failed / report_failure()
//!     │   ↓                    ↓
//!     └─ Disconnected ←────────┘
//!          (backoff)
//!
//! close_all(): any state → Closing → Disconnected
//! ```
//!
//! The supervisor never gives up: only the interval between dials is
//! bounded. Every transition is published on a per-connection `watch`
//! channel, so connectors pause and resume without polling, and emitted as
//! a [`ReplicatorEvent`].
//!
//! Connections are kept alive until [`close_all()`](EndpointPool::close_all)
//! even when every handle is released, so restarting a connector never
//! triggers a reconnect storm.

use crate::config::{EndpointConfig, EndpointKind, ReconnectConfig};
use crate::error::{ReplicatorError, Result};
use crate::events::{EventBus, ReplicatorEvent};
use crate::metrics;
use crate::transport::{AckToken, Dialer, Message, SubscribeRequest, Subscription, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

/// State of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not connected; a dial is scheduled.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Connected and passing health checks.
    Connected,
    /// Pool shutting down.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closing => write!(f, "Closing"),
        }
    }
}

/// What makes two endpoint entries the same cluster.
///
/// The endpoint name is deliberately absent: aliases share a connection.
/// Server order is normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointIdentity {
    pub kind: EndpointKind,
    pub servers: Vec<String>,
    pub cluster_id: Option<String>,
    pub client_id: Option<String>,
    pub credentials: Option<String>,
}

impl From<&EndpointConfig> for EndpointIdentity {
    fn from(config: &EndpointConfig) -> Self {
        let mut servers: Vec<String> = config.servers.iter().map(|s| s.trim().to_string()).collect();
        servers.sort();
        servers.dedup();
        Self {
            kind: config.kind,
            servers,
            cluster_id: config.cluster_id.clone(),
            client_id: config.client_id.clone(),
            credentials: config.credentials.clone(),
        }
    }
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub kind: EndpointKind,
    pub state: ConnectionState,
    pub connects: u64,
    pub disconnects: u64,
    pub subscriptions: usize,
    pub handles: usize,
    pub last_error: Option<String>,
    /// Unix millis of the last successful dial (0 = never).
    pub last_connected_ms: u64,
}

/// One supervised connection. Reached through [`EndpointHandle`].
pub struct EndpointConnection {
    config: EndpointConfig,
    identity: EndpointIdentity,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Arc<AtomicUsize>,
    handles: AtomicUsize,
    connects: AtomicU64,
    disconnects: AtomicU64,
    last_connected_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
    /// Wakes the supervisor to ping right away.
    check_now: Notify,
}

impl EndpointConnection {
    fn new(config: EndpointConfig) -> Self {
        let identity = EndpointIdentity::from(&config);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            identity,
            transport: RwLock::new(None),
            state_tx,
            subscriptions: Arc::new(AtomicUsize::new(0)),
            handles: AtomicUsize::new(0),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            last_connected_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
            check_now: Notify::new(),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState, events: &EventBus) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            metrics::set_connection_state(self.name(), &state.to_string());
            events.emit(ReplicatorEvent::ConnectionStateChanged {
                endpoint: self.config.name.clone(),
                state,
            });
        }
    }

    fn install(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.last_connected_ms.store(epoch_millis(), Ordering::Relaxed);
        *self.last_error.lock() = None;
    }

    fn uninstall(&self) -> Option<Arc<dyn Transport>> {
        self.transport.write().take()
    }

    fn current(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| ReplicatorError::NotConnected {
                endpoint: self.config.name.clone(),
            })
    }

    fn record_error(&self, error: &ReplicatorError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    async fn ping(&self, limit: Duration) -> Result<()> {
        let transport = self.current()?;
        match timeout(limit, transport.ping()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicatorError::timeout("ping", limit)),
        }
    }

    fn status(&self) -> EndpointStatus {
        EndpointStatus {
            name: self.config.name.clone(),
            kind: self.config.kind,
            state: self.state(),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            handles: self.handles.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            last_connected_ms: self.last_connected_ms.load(Ordering::Relaxed),
        }
    }
}

/// A reference to a pooled connection.
///
/// Usable as soon as it is acquired. Operations on a connection that is not
/// currently up fail fast with [`ReplicatorError::NotConnected`]; callers
/// wait on [`watch_state()`](Self::watch_state) instead of retrying blindly.
pub struct EndpointHandle {
    conn: Arc<EndpointConnection>,
}

impl EndpointHandle {
    fn new(conn: Arc<EndpointConnection>) -> Self {
        conn.handles.fetch_add(1, Ordering::Relaxed);
        Self { conn }
    }

    /// Name of the endpoint entry that created the connection.
    pub fn name(&self) -> &str {
        self.conn.name()
    }

    pub fn kind(&self) -> EndpointKind {
        self.conn.config.kind
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.conn.identity
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.conn.config
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver for connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state_tx.subscribe()
    }

    /// Whether headers published here survive to subscribers.
    pub fn supports_headers(&self) -> bool {
        match self.conn.current() {
            Ok(transport) => transport.supports_headers(),
            Err(_) => self.kind() == EndpointKind::DurableStream,
        }
    }

    pub async fn publish(&self, message: &Message) -> Result<()> {
        let transport = self.conn.current()?;
        transport.publish(message).await
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
        let transport = self.conn.current()?;
        let subscription = transport.subscribe(request).await?;
        Ok(subscription.tracked(Arc::clone(&self.conn.subscriptions)))
    }

    pub async fn ack(&self, token: &AckToken) -> Result<()> {
        let transport = self.conn.current()?;
        transport.ack(token).await
    }

    /// Ask the supervisor to verify the connection now.
    ///
    /// Call after an operation failed with a connection-class error.
    pub fn report_failure(&self) {
        self.conn.check_now.notify_one();
    }

    pub fn status(&self) -> EndpointStatus {
        self.conn.status()
    }
}

impl Clone for EndpointHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.conn))
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.conn.handles.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Deduplicating pool of supervised endpoint connections.
pub struct EndpointPool {
    dialer: Arc<dyn Dialer>,
    reconnect: ReconnectConfig,
    events: EventBus,
    connections: DashMap<EndpointIdentity, Arc<EndpointConnection>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl EndpointPool {
    pub fn new(dialer: Arc<dyn Dialer>, reconnect: ReconnectConfig, events: EventBus) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dialer,
            reconnect,
            events,
            connections: DashMap::new(),
            supervisors: Mutex::new(Vec::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the connection for `config`'s identity, creating it if absent.
    ///
    /// Never waits for the network. Must be called inside a Tokio runtime.
    pub fn acquire(&self, config: &EndpointConfig) -> Result<EndpointHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicatorError::Shutdown);
        }

        let identity = EndpointIdentity::from(config);
        let conn = match self.connections.entry(identity) {
            Entry::Occupied(entry) => {
                debug!(endpoint = %config.name, shared_with = %entry.get().name(), "Reusing pooled connection");
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                let conn = Arc::new(EndpointConnection::new(config.clone()));
                self.spawn_supervisor(Arc::clone(&conn));
                entry.insert(Arc::clone(&conn));
                conn
            }
        };

        Ok(EndpointHandle::new(conn))
    }

    /// Give a handle back. Connections stay open until [`close_all()`](Self::close_all).
    pub fn release(&self, handle: EndpointHandle) {
        drop(handle);
    }

    fn spawn_supervisor(&self, conn: Arc<EndpointConnection>) {
        let span = tracing::info_span!("endpoint", endpoint = %conn.name(), kind = %conn.config.kind);
        let supervisor = supervise(
            conn,
            Arc::clone(&self.dialer),
            self.reconnect.clone(),
            self.shutdown_tx.subscribe(),
            self.events.clone(),
        );
        let handle = tokio::spawn(supervisor.instrument(span));
        self.supervisors.lock().push(handle);
    }

    /// Number of distinct connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.value().state() == ConnectionState::Connected)
            .count()
    }

    /// Status of every connection, sorted by name. Never touches the network.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let mut status: Vec<EndpointStatus> = self.connections.iter().map(|c| c.value().status()).collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Stop every supervisor and close every connection.
    ///
    /// Idempotent. Later `acquire` calls fail with `Shutdown`.
    pub async fn close_all(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions: usize = self
            .connections
            .iter()
            .map(|c| c.value().subscriptions.load(Ordering::Relaxed))
            .sum();
        info!(
            connections = self.connections.len(),
            subscriptions,
            "Closing endpoint pool"
        );

        self.shutdown_tx.send_replace(true);

        let supervisors: Vec<_> = std::mem::take(&mut *self.supervisors.lock());
        for (i, handle) in supervisors.into_iter().enumerate() {
            match timeout(grace, handle).await {
                Ok(Ok(())) => debug!(supervisor = i + 1, "Supervisor stopped"),
                Ok(Err(e)) => warn!(supervisor = i + 1, error = %e, "Supervisor panicked during shutdown"),
                Err(_) => warn!(supervisor = i + 1, "Supervisor timed out during shutdown"),
            }
        }

        metrics::set_connected_endpoints(0);
    }
}

/// Why a connected period ended.
enum MonitorExit {
    Shutdown,
    Lost(ReplicatorError),
}

/// Dial, watch, redial. Runs until the pool shuts down.
async fn supervise(
    conn: Arc<EndpointConnection>,
    dialer: Arc<dyn Dialer>,
    reconnect: ReconnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    events: EventBus,
) {
    let backoff = reconnect.backoff();
    let dial_timeout = reconnect.dial_timeout_duration();
    let health_interval = reconnect.health_check_interval_duration();
    let servers = conn.config.servers.clone();

    let mut server_index = if reconnect.randomize && !conn.config.no_randomize && servers.len() > 1 {
        rand::rng().random_range(0..servers.len())
    } else {
        0
    };
    let mut attempt: u32 = 0;

    'supervise: loop {
        if *shutdown_rx.borrow() || servers.is_empty() {
            break;
        }

        let server = &servers[server_index % servers.len()];
        conn.set_state(ConnectionState::Connecting, &events);
        debug!(server = %server, attempt = attempt + 1, "Dialing endpoint");

        let dialed = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break 'supervise,
            result = timeout(dial_timeout, dialer.dial(&conn.config, server)) => result,
        };
        let result = dialed.unwrap_or_else(|_| Err(ReplicatorError::timeout("dial", dial_timeout)));

        let failure = match result {
            Ok(transport) => {
                metrics::record_connection_attempt(conn.name(), true);
                if attempt > 0 {
                    info!(server = %server, attempts = attempt + 1, "Connected after retry");
                }
                attempt = 0;
                conn.install(transport);
                conn.set_state(ConnectionState::Connected, &events);

                match monitor(&conn, &mut shutdown_rx, health_interval, dial_timeout).await {
                    MonitorExit::Shutdown => break 'supervise,
                    MonitorExit::Lost(error) => {
                        conn.disconnects.fetch_add(1, Ordering::Relaxed);
                        conn.record_error(&error);
                        metrics::record_disconnect(conn.name());
                        if let Some(stale) = conn.uninstall() {
                            let _ = timeout(dial_timeout, stale.close()).await;
                        }
                        conn.set_state(ConnectionState::Disconnected, &events);
                        None
                    }
                }
            }
            Err(error) => {
                metrics::record_connection_attempt(conn.name(), false);
                conn.record_error(&error);
                conn.set_state(ConnectionState::Disconnected, &events);
                Some(error)
            }
        };

        server_index = server_index.wrapping_add(1);
        attempt = attempt.saturating_add(1);
        let delay = backoff.delay_for_attempt(attempt);

        if let Some(error) = failure {
            events.emit(ReplicatorEvent::ConnectionFailed {
                endpoint: conn.config.name.clone(),
                attempt,
                error: error.to_string(),
                retry_in: delay,
            });
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break 'supervise,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    conn.set_state(ConnectionState::Closing, &events);
    if let Some(transport) = conn.uninstall() {
        if let Err(e) = timeout(dial_timeout, transport.close()).await.unwrap_or(Ok(())) {
            debug!(error = %e, "Error closing transport");
        }
    }
    conn.set_state(ConnectionState::Disconnected, &events);
    debug!("Endpoint supervisor stopped");
}

/// Ping on an interval, or right away when a user reports a failure.
async fn monitor(
    conn: &EndpointConnection,
    shutdown_rx: &mut watch::Receiver<bool>,
    interval: Duration,
    ping_timeout: Duration,
) -> MonitorExit {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately; the dial just proved the connection.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return MonitorExit::Shutdown,
            _ = conn.check_now.notified() => {
                debug!("Connection check requested");
            }
            _ = ticker.tick() => {}
        }

        if let Err(error) = conn.ping(ping_timeout).await {
            return MonitorExit::Lost(error);
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
