//! Named collection of database connections.
//!
//! The registry is what the liveness checker draws its snapshot from, and
//! where its lost-connection reports land.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, Connection};
use crate::error::{QuestError, Result};

/// Connections by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<String, Arc<dyn Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates one (unopened) connection per named entry of the configuration.
    pub fn from_config(config: &Config) -> Self {
        let registry = Self::new();
        for (name, conn_config) in &config.connections {
            registry.add(db::connect(name, conn_config));
        }
        registry
    }

    /// Adds a connection, returning the one it replaces (same id), if any.
    pub fn add(&self, conn: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.connections
            .write()
            .insert(conn.id().to_string(), conn)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Like [`get`](Self::get), with a configuration error naming the id.
    pub fn require(&self, id: &str) -> Result<Arc<dyn Connection>> {
        self.get(id)
            .ok_or_else(|| QuestError::config(format!("Connection '{}' not found", id)))
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Connection ids in order.
    pub fn ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    /// All connections, open or not, in id order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Connections currently marked open.
    pub fn open_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .read()
            .values()
            .filter(|conn| conn.is_open())
            .cloned()
            .collect()
    }

    /// Opens every connection, returning the ones that failed to open.
    pub async fn open_all(&self) -> Vec<(String, QuestError)> {
        let mut failures = Vec::new();
        for conn in self.snapshot() {
            match conn.open().await {
                Ok(()) => info!(connection = conn.id(), "Connection opened"),
                Err(e) => {
                    warn!(connection = conn.id(), error = %e, "Failed to open connection");
                    failures.push((conn.id().to_string(), e));
                }
            }
        }
        failures
    }

    /// Closes every open connection.
    pub async fn close_all(&self) {
        for conn in self.open_connections() {
            if let Err(e) = conn.close().await {
                warn!(connection = conn.id(), error = %e, "Failed to close connection");
            }
        }
    }

    /// Logs connections reported lost; the checker has already closed them.
    pub fn mark_lost(&self, lost: &[Arc<dyn Connection>]) {
        for conn in lost {
            let known = self.connections.read().contains_key(conn.id());
            warn!(connection = conn.id(), known, "Connection lost");
        }
    }

    /// Supplier for the liveness checker.
    pub fn supplier(self: &Arc<Self>) -> impl Fn() -> Vec<Arc<dyn Connection>> + Send + Sync + 'static {
        let registry = Arc::clone(self);
        move || registry.snapshot()
    }

    /// Lost-connections handler for the liveness checker.
    pub fn lost_handler(self: &Arc<Self>) -> impl Fn(Vec<Arc<dyn Connection>>) + Send + Sync + 'static {
        let registry = Arc::clone(self);
        move |lost| registry.mark_lost(&lost)
    }
}
