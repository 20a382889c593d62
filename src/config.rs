//! Configuration for the message replicator.
//!
//! Configuration is handed to [`Replicator::new()`](crate::Replicator::new)
//! already parsed. It can be built programmatically or deserialized from
//! YAML/JSON by the embedding process.
//!
//! # Quick Start
//!
//! ```rust
//! use message_replicator::config::{ConnectorConfig, EndpointConfig, EndpointKind, ReplicatorConfig};
//!
//! let config = ReplicatorConfig {
//!     endpoints: vec![
//!         EndpointConfig::for_testing("a", EndpointKind::CorePubSub, "redis://a:6379"),
//!         EndpointConfig::for_testing("b", EndpointKind::DurableStream, "redis://b:6379"),
//!     ],
//!     connectors: vec![ConnectorConfig::for_testing("one", "a", "orders", "b", "orders")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── endpoints: Vec<EndpointConfig>     # Clusters, referenced by name
//! ├── connectors: Vec<ConnectorConfig>   # One forwarding path each
//! └── settings: ReplicatorSettings
//!     ├── failure_policy                 # best_effort | fail_fast
//!     ├── start_timeout
//!     ├── reconnect: ReconnectConfig     # Endpoint pool backoff
//!     ├── forward: ForwardConfig         # Per-message retry and buffering
//!     └── shutdown: ShutdownConfig       # Drain and global deadlines
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! endpoints:
//!   - name: "edge"
//!     kind: core_pub_sub
//!     servers: ["redis://edge-1:6379", "redis://edge-2:6379"]
//!   - name: "core"
//!     kind: durable_stream
//!     servers: ["redis://core:6379"]
//!     client_id: "replicator-1"
//!
//! connectors:
//!   - name: "orders-up"
//!     source: { endpoint: "edge", subject: "orders.*" }
//!     destination: { endpoint: "core", subject: "orders" }
//!
//! settings:
//!   failure_policy: best_effort
//!   reconnect:
//!     max_delay_ms: 30000
//!     randomize: true
//!   shutdown:
//!     drain_timeout: "5s"
//! ```

use crate::error::{ReplicatorError, Result};
use crate::pool::EndpointIdentity;
use crate::resilience::{Backoff, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to Replicator::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Replicator::new()`.
///
/// Immutable once handed over. Connectors are started in declared order,
/// but order carries no meaning: every connector is independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Clusters the replicator talks to, referenced by name from connectors.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Forwarding paths.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,

    /// Global policy.
    #[serde(default)]
    pub settings: ReplicatorSettings,
}

impl ReplicatorConfig {
    /// Create a config with fast timeouts and deterministic reconnects.
    pub fn for_testing(endpoints: Vec<EndpointConfig>, connectors: Vec<ConnectorConfig>) -> Self {
        Self {
            endpoints,
            connectors,
            settings: ReplicatorSettings::for_testing(),
        }
    }

    /// Look up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// Check every structural rule before anything touches the network.
    ///
    /// Returns the first violation found, in declaration order.
    pub fn validate(&self) -> Result<()> {
        let mut endpoint_names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ReplicatorError::Config("endpoint with empty name".to_string()));
            }
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(ReplicatorError::Config(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if endpoint.servers.is_empty() {
                return Err(ReplicatorError::Config(format!(
                    "endpoint '{}' has no servers",
                    endpoint.name
                )));
            }
        }

        let by_name: HashMap<&str, &EndpointConfig> =
            self.endpoints.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut connector_names = HashSet::new();
        for connector in &self.connectors {
            if connector.name.is_empty() {
                return Err(ReplicatorError::Config("connector with empty name".to_string()));
            }
            if !connector_names.insert(connector.name.as_str()) {
                return Err(ReplicatorError::DuplicateConnector(connector.name.clone()));
            }

            let source = lookup(&by_name, &connector.name, &connector.source.endpoint)?;
            let destination = lookup(&by_name, &connector.name, &connector.destination.endpoint)?;

            if connector.source.subject.is_empty() || connector.destination.subject.is_empty() {
                return Err(ReplicatorError::Config(format!(
                    "connector '{}' has an empty subject",
                    connector.name
                )));
            }

            if source.kind == EndpointKind::CorePubSub {
                if connector.source.queue_group.is_some() {
                    return Err(ReplicatorError::Config(format!(
                        "connector '{}': queue groups require a durable stream source",
                        connector.name
                    )));
                }
                if connector.source.start_position != StartPosition::NewOnly {
                    return Err(ReplicatorError::Config(format!(
                        "connector '{}': start positions require a durable stream source",
                        connector.name
                    )));
                }
            }

            check_self_loop(connector, source, destination)?;
        }

        Ok(())
    }
}

fn lookup<'a>(
    by_name: &HashMap<&str, &'a EndpointConfig>,
    connector: &str,
    endpoint: &str,
) -> Result<&'a EndpointConfig> {
    by_name
        .get(endpoint)
        .copied()
        .ok_or_else(|| ReplicatorError::UnknownEndpoint {
            connector: connector.to_string(),
            endpoint: endpoint.to_string(),
        })
}

/// Fail if the source and destination are the same subject on the same cluster.
///
/// Endpoints are compared by identity, not by name, so two aliases of one
/// cluster are caught too.
pub fn check_self_loop(
    connector: &ConnectorConfig,
    source: &EndpointConfig,
    destination: &EndpointConfig,
) -> Result<()> {
    if EndpointIdentity::from(source) == EndpointIdentity::from(destination)
        && connector.source.subject == connector.destination.subject
    {
        return Err(ReplicatorError::SelfLoop {
            connector: connector.name.clone(),
            endpoint: source.name.clone(),
            subject: connector.source.subject.clone(),
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// EndpointConfig: one external cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Which messaging model an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Fire-and-forget subjects (Redis Pub/Sub). No acks, no replay.
    CorePubSub,
    /// Durable channels with consumer groups (Redis Streams). Acked, replayable.
    DurableStream,
}

impl EndpointKind {
    /// Whether deliveries from this kind must be acknowledged after forwarding.
    pub fn requires_ack(&self) -> bool {
        matches!(self, EndpointKind::DurableStream)
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::CorePubSub => write!(f, "core_pub_sub"),
            EndpointKind::DurableStream => write!(f, "durable_stream"),
        }
    }
}

/// An external cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name connectors use to reference this endpoint.
    pub name: String,

    pub kind: EndpointKind,

    /// Server addresses (e.g. `redis://host:6379`). Tried in rotation.
    pub servers: Vec<String>,

    /// Logical cluster identifier. Part of the endpoint identity only.
    #[serde(default)]
    pub cluster_id: Option<String>,

    /// Client identifier. Used as the consumer name on durable streams.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Opaque credentials reference handed to the dialer.
    /// The Redis dialer uses it as the AUTH password.
    #[serde(default)]
    pub credentials: Option<String>,

    /// Always try servers in declared order instead of a random rotation.
    #[serde(default = "default_false")]
    pub no_randomize: bool,

    /// Block timeout for durable stream reads, as a duration string.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per durable stream read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_block_timeout() -> String {
    "1s".to_string()
}

fn default_batch_size() -> usize {
    100
}

impl EndpointConfig {
    /// Create an endpoint with a single server and default options.
    pub fn for_testing(name: &str, kind: EndpointKind, server: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            servers: vec![server.to_string()],
            cluster_id: None,
            client_id: None,
            credentials: None,
            no_randomize: false,
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
        }
    }

    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectorConfig: one forwarding path
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a durable source starts reading when its consumer group is new.
///
/// Existing groups always resume from their last acknowledged entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Only messages published after the subscription.
    #[default]
    NewOnly,
    /// Everything still retained.
    DeliverAll,
    /// Entries after the given stream id.
    Sequence(String),
    /// Entries at or after the given Unix time in milliseconds.
    Time(u64),
}

/// Source side of a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub endpoint: String,
    /// Subject or channel. Glob characters make a pattern subscription on pub/sub.
    pub subject: String,
    /// Consumer group (durable name) shared by cooperating replicators.
    /// Defaults to `replicator:<connector name>`.
    #[serde(default)]
    pub queue_group: Option<String>,
    #[serde(default)]
    pub start_position: StartPosition,
}

/// Destination side of a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub endpoint: String,
    pub subject: String,
}

/// How exhausted forwarding retries are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Count the failure and keep forwarding.
    #[default]
    BestEffort,
    /// Stop the connector (and, at start, the whole replicator).
    FailFast,
}

/// One source to destination forwarding path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unique connector name.
    pub name: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,

    /// Disable dropping of messages this connector already forwarded once.
    #[serde(default = "default_false")]
    pub no_echo_suppression: bool,

    /// Overrides the global failure policy for this connector.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
}

impl ConnectorConfig {
    /// Create a connector from endpoint names and subjects.
    pub fn for_testing(
        name: &str,
        source_endpoint: &str,
        source_subject: &str,
        destination_endpoint: &str,
        destination_subject: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            source: SourceConfig {
                endpoint: source_endpoint.to_string(),
                subject: source_subject.to_string(),
                queue_group: None,
                start_position: StartPosition::NewOnly,
            },
            destination: DestinationConfig {
                endpoint: destination_endpoint.to_string(),
                subject: destination_subject.to_string(),
            },
            no_echo_suppression: false,
            failure_policy: None,
        }
    }

    /// Consumer group used on durable sources.
    pub fn consumer_group(&self) -> String {
        self.source
            .queue_group
            .clone()
            .unwrap_or_else(|| format!("replicator:{}", self.name))
    }

    /// Effective failure policy given the global default.
    pub fn effective_policy(&self, global: FailurePolicy) -> FailurePolicy {
        self.failure_policy.unwrap_or(global)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorSettings: global policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Global policy flags and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How long `start()` waits for each connector to leave `Starting`.
    #[serde(default = "default_start_timeout")]
    pub start_timeout: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_start_timeout() -> String {
    "5s".to_string()
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            start_timeout: default_start_timeout(),
            reconnect: ReconnectConfig::default(),
            forward: ForwardConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl ReplicatorSettings {
    /// Fast, deterministic settings for tests.
    pub fn for_testing() -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            start_timeout: "2s".to_string(),
            reconnect: ReconnectConfig::for_testing(),
            forward: ForwardConfig::for_testing(),
            shutdown: ShutdownConfig::for_testing(),
        }
    }

    pub fn start_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.start_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconnectConfig: endpoint pool dial and reconnect policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Endpoint pool reconnect policy.
///
/// Reconnects never give up. Only the interval between attempts is bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first redial, in milliseconds.
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the exponential delay, in milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Fraction of each delay that is randomized (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Randomize delays and server order. Disable for reproducible tests.
    #[serde(default = "default_true")]
    pub randomize: bool,

    /// Per-attempt dial timeout.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: String,

    /// Interval between liveness pings on a connected endpoint.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: String,
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_dial_timeout() -> String {
    "5s".to_string()
}

fn default_health_check_interval() -> String {
    "5s".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            randomize: true,
            dial_timeout: default_dial_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl ReconnectConfig {
    pub fn for_testing() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
            jitter: 0.0,
            randomize: false,
            dial_timeout: "500ms".to_string(),
            health_check_interval: "25ms".to_string(),
        }
    }

    pub fn dial_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.dial_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn health_check_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.health_check_interval).unwrap_or(Duration::from_secs(5))
    }

    /// Backoff schedule for redials.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: self.backoff_factor,
            jitter: if self.randomize { self.jitter } else { 0.0 },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ForwardConfig: per-message retry, buffering and rate limiting
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-message forwarding policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Extra publish attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_delay_ms: u64,

    /// Deadline for one publish acknowledgment.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: String,

    /// Accepted-but-unforwarded messages a connector may hold.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (per connector)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn default_publish_timeout() -> String {
    "5s".to_string()
}

fn default_max_pending() -> usize {
    1024
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_ms(),
            retry_max_delay_ms: default_retry_max_ms(),
            publish_timeout: default_publish_timeout(),
            max_pending: default_max_pending(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ForwardConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 50,
            publish_timeout: "250ms".to_string(),
            max_pending: 64,
            ..Default::default()
        }
    }

    pub fn publish_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.publish_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Backoff schedule for one message's retries. Deterministic.
    pub fn retry_backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            per_second: self.rate_limit_per_sec,
            burst: self.rate_limit_burst,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ShutdownConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Drain deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Per-connector time to finish in-flight messages after `stop()`.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Global deadline for stopping every connector.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_drain_timeout() -> String {
    "5s".to_string()
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn for_testing() -> Self {
        Self {
            drain_timeout: "1s".to_string(),
            shutdown_timeout: "3s".to_string(),
        }
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
