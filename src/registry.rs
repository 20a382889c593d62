//! Connector registry: every configured connector, by name.
//!
//! Owned by the [`Replicator`](crate::Replicator) and handed out by
//! reference to whoever needs read access. Lookups and snapshots take only
//! per-shard map locks and each connector's stats lock, so they never wait
//! on a running pump.

use crate::connector::{Connector, ConnectorSnapshot};
use crate::error::{ReplicatorError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Name-unique set of connectors.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connector. Fails if the name is taken.
    pub fn register(&self, connector: Arc<Connector>) -> Result<()> {
        match self.connectors.entry(connector.name().to_string()) {
            Entry::Occupied(entry) => Err(ReplicatorError::DuplicateConnector(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(connector);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connector>> {
        self.connectors.get(name).map(|c| Arc::clone(c.value()))
    }

    /// All connectors, sorted by name.
    pub fn all(&self) -> Vec<Arc<Connector>> {
        let mut all: Vec<Arc<Connector>> = self.connectors.iter().map(|c| Arc::clone(c.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Point-in-time state and statistics of every connector, sorted by name.
    pub fn snapshot(&self) -> Vec<ConnectorSnapshot> {
        let mut snapshots: Vec<ConnectorSnapshot> = self.connectors.iter().map(|c| c.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.connectors.len())
            .finish()
    }
}
