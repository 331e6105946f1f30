use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectionId, ConnectionSender, Topic};
pub use crate::store::Identity;

/// One live WebSocket session.
///
/// Owned by the `ConnectionRegistry`. The sender and shutdown token together
/// form the transport handle: nothing outside the registry's unregister path
/// closes them.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    sender: ConnectionSender,
    shutdown: CancellationToken,
    pub identity: Option<Identity>,
    /// Mirror of this connection's memberships in the `SubscriptionIndex`.
    pub subscribed_topics: HashSet<Topic>,
    pub connected_at: Instant,
    pub last_seen_at: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, sender: ConnectionSender, shutdown: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            shutdown,
            identity: None,
            subscribed_topics: HashSet::new(),
            connected_at: now,
            last_seen_at: now,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn sender(&self) -> &ConnectionSender {
        &self.sender
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    /// Close the transport: queue a Close frame for the writer and cancel the
    /// reader loop. Safe to call on an already-closed transport.
    pub(crate) fn close(&self, code: u16, reason: &str) {
        let frame = axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self
            .sender
            .send(axum::extract::ws::Message::Close(Some(frame)));
        self.shutdown.cancel();
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut topics: Vec<Topic> = self.subscribed_topics.iter().cloned().collect();
        topics.sort();
        ConnectionInfo {
            id: self.id,
            authenticated: self.is_authenticated(),
            identity: self.identity.clone(),
            subscribed_topics: topics,
            connected_at: self.connected_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Read-only copy of a connection's state, handed out by `Hub::connection`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub authenticated: bool,
    pub identity: Option<Identity>,
    pub subscribed_topics: Vec<Topic>,
    pub connected_at: Instant,
    pub last_seen_at: Instant,
}
