//! In-memory topologies for scenario tests.
//!
//! Each [`Topology`] is a set of [`MemoryBroker`]s reachable through one
//! [`MemoryDialer`] at `memory://<name>`.

use message_replicator::config::{ConnectorConfig, EndpointConfig, EndpointKind, ReplicatorConfig};
use message_replicator::transport::memory::{MemoryBroker, MemoryDialer};
use message_replicator::Replicator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for polling assertions.
pub const WAIT: Duration = Duration::from_secs(5);

/// Named brokers behind one dialer.
pub struct Topology {
    brokers: HashMap<String, MemoryBroker>,
    endpoints: Vec<EndpointConfig>,
    dialer: MemoryDialer,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            brokers: HashMap::new(),
            endpoints: Vec::new(),
            dialer: MemoryDialer::new(),
        }
    }

    /// Add a cluster reachable at `memory://<name>` and an endpoint entry for it.
    pub fn cluster(mut self, name: &str, kind: EndpointKind) -> Self {
        let server = format!("memory://{}", name);
        let broker = MemoryBroker::new(name, kind);
        self.dialer.register(&server, broker.clone());
        self.brokers.insert(name.to_string(), broker);
        self.endpoints.push(EndpointConfig::for_testing(name, kind, &server));
        self
    }

    /// Add a second endpoint name for an existing cluster.
    pub fn alias(mut self, alias: &str, of: &str) -> Self {
        let mut endpoint = self
            .endpoints
            .iter()
            .find(|e| e.name == of)
            .cloned()
            .expect("alias of unknown cluster");
        endpoint.name = alias.to_string();
        self.endpoints.push(endpoint);
        self
    }

    pub fn broker(&self, name: &str) -> &MemoryBroker {
        self.brokers.get(name).expect("unknown broker")
    }

    pub fn config(&self, connectors: Vec<ConnectorConfig>) -> ReplicatorConfig {
        ReplicatorConfig::for_testing(self.endpoints.clone(), connectors)
    }

    pub fn replicator(&self, config: ReplicatorConfig) -> Replicator {
        Replicator::with_dialer(config, Arc::new(self.dialer.clone()))
    }

    /// Shorthand for `replicator(config(connectors))`.
    pub fn replicator_for(&self, connectors: Vec<ConnectorConfig>) -> Replicator {
        self.replicator(self.config(connectors))
    }
}

/// Two clusters: `a` (pub/sub) and `b` (durable stream).
pub fn pubsub_to_stream() -> Topology {
    Topology::new()
        .cluster("a", EndpointKind::CorePubSub)
        .cluster("b", EndpointKind::DurableStream)
}

/// Two durable stream clusters, `a` and `b`.
pub fn stream_to_stream() -> Topology {
    Topology::new()
        .cluster("a", EndpointKind::DurableStream)
        .cluster("b", EndpointKind::DurableStream)
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

/// Wait until every endpoint in the pool is connected.
pub async fn wait_connected(replicator: &Replicator) {
    wait_for("all endpoints connected", || {
        let pool = replicator.pool();
        pool.connected_count() == pool.len()
    })
    .await;
}
