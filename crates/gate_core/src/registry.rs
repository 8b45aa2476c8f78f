//! Process-wide registry of live connections.
//!
//! The registry and the admission table are the only cross-connection shared
//! state in the crate. The registry exists for two reasons: enforcing the
//! connection cap at accept time, and orderly shutdown of everything at once.

use crate::connection::{Connection, ConnectionId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Set of live [`Connection`]s, keyed by connection id.
///
/// Constructor-injected and owned by the server's composition root rather
/// than a hidden global; passed by reference to the accept path.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self { connections: DashMap::new(), next_id: AtomicU64::new(1), max_connections }
    }

    /// Allocates the next connection id.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether the accept path must refuse new sockets.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Hard stop used at process shutdown: every live connection is closed
    /// without waiting for its write queue to drain. This is an intentional
    /// deviation from the per-connection graceful-drain path.
    pub async fn disconnect_all(&self) {
        // Collect first: disconnect() removes entries, and removing while
        // iterating a DashMap shard deadlocks.
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|entry| Arc::clone(entry.value())).collect();
        let count = connections.len();
        for connection in connections {
            connection.close_socket();
            connection.disconnect().await;
        }
        if count > 0 {
            info!(count, "closed all live connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let registry = ConnectionRegistry::new(16);
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_capacity_check() {
        let registry = ConnectionRegistry::new(0);
        assert!(registry.is_full());
        let roomy = ConnectionRegistry::new(4);
        assert!(!roomy.is_full());
        assert!(roomy.is_empty());
    }
}
