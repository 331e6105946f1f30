use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::Connection;
use super::{ConnectionId, ConnectionSender};

/// Authoritative set of live connections.
///
/// The only place a `Connection` is created or destroyed. Not synchronised on
/// its own: the `Hub` holds it behind the same lock as the `SubscriptionIndex`
/// so removal and index cleanup happen together.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new anonymous connection and return its id.
    pub fn register(&mut self, sender: ConnectionSender, shutdown: CancellationToken) -> ConnectionId {
        let mut id = Uuid::new_v4();
        while self.connections.contains_key(&id) {
            id = Uuid::new_v4();
        }
        self.connections
            .insert(id, Connection::new(id, sender, shutdown));
        id
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Returns `None` if it was already gone.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Ids of connections not heard from within `timeout` as of `now`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_seen_at) > timeout)
            .map(|conn| conn.id)
            .collect()
    }
}
