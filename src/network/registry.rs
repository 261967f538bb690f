//! Connection registry
//!
//! Maps each admitted connection's identity to its [`Connection`] handle.
//! Lookups hand out clones of the handle, never references into the map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;

/// Unique identity assigned to a server-side connection at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared identity -> connection map
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; returns false if the identity was already present
    pub async fn insert(&self, id: ConnectionId, connection: Connection) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return false;
        }
        connections.insert(id, connection);
        true
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(id).cloned()
    }

    /// Remove a connection, returning it if it was present
    pub async fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.write().await.remove(id)
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Identities present at the time of the call
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Copy of every entry present at the time of the call
    pub async fn snapshot(&self) -> Vec<(ConnectionId, Connection)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, connection)| (*id, connection.clone()))
            .collect()
    }
}
