use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionInfo, Identity};
use super::registry::ConnectionRegistry;
use super::subscriptions::SubscriptionIndex;
use super::{ConnectionId, ConnectionSender, Topic};

/// Normal closure (client went away or server shut the socket).
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away: the hub dropped the connection.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Returned when an operation targets a connection that is not (or no longer)
/// registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {0} is not registered")]
pub struct NotConnected(pub ConnectionId);

/// The in-memory session layer for one running hub.
///
/// Registry and subscription index share a single lock so both sides of the
/// topic mapping change in one critical section. The lock is never held
/// across an await point or a transport send.
#[derive(Debug, Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    registry: ConnectionRegistry,
    index: SubscriptionIndex,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted transport as an anonymous connection.
    /// The returned token is cancelled when the hub closes the connection.
    pub fn register(&self, sender: ConnectionSender) -> (ConnectionId, CancellationToken) {
        let shutdown = CancellationToken::new();
        let id = self.inner.lock().registry.register(sender, shutdown.clone());
        tracing::debug!(connection_id = %id, "Connection registered");
        (id, shutdown)
    }

    /// Remove a connection, drop all of its subscriptions and close its
    /// transport. Returns false if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.unregister_with(id, CLOSE_NORMAL, "closed")
    }

    pub fn unregister_with(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        let (conn, dropped_topics) = {
            let mut inner = self.inner.lock();
            let HubInner { registry, index } = &mut *inner;
            let Some(mut conn) = registry.remove(id) else {
                return false;
            };
            let dropped = index.remove_connection(&mut conn);
            (conn, dropped)
        };

        conn.close(code, reason);

        tracing::debug!(
            connection_id = %id,
            topics = dropped_topics,
            reason = reason,
            "Connection unregistered"
        );
        true
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.inner.lock().registry.get(id).map(|conn| conn.info())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().registry.contains(id)
    }

    /// Record inbound activity on a connection.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: &ConnectionId, now: Instant) -> bool {
        match self.inner.lock().registry.get_mut(id) {
            Some(conn) => {
                conn.touch(now);
                true
            }
            None => false,
        }
    }

    /// Promote a connection to authenticated. The latest identity wins.
    pub fn set_identity(&self, id: &ConnectionId, identity: Identity) -> Result<(), NotConnected> {
        let mut inner = self.inner.lock();
        let conn = inner.registry.get_mut(id).ok_or(NotConnected(*id))?;
        conn.identity = Some(identity);
        Ok(())
    }

    pub fn identity(&self, id: &ConnectionId) -> Option<Identity> {
        self.inner
            .lock()
            .registry
            .get(id)
            .and_then(|conn| conn.identity.clone())
    }

    /// Returns Ok(false) if the connection was already subscribed.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, NotConnected> {
        let mut inner = self.inner.lock();
        let HubInner { registry, index } = &mut *inner;
        let conn = registry.get_mut(id).ok_or(NotConnected(*id))?;
        Ok(index.subscribe(conn, topic))
    }

    /// Returns Ok(false) if the connection was not subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, NotConnected> {
        let mut inner = self.inner.lock();
        let HubInner { registry, index } = &mut *inner;
        let conn = registry.get_mut(id).ok_or(NotConnected(*id))?;
        Ok(index.unsubscribe(conn, topic))
    }

    pub fn members_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.inner.lock().index.members_of(topic)
    }

    /// Members of `topic` paired with their senders, taken in one lock.
    pub fn topic_senders(&self, topic: &str) -> Vec<(ConnectionId, ConnectionSender)> {
        let inner = self.inner.lock();
        inner
            .index
            .members_of(topic)
            .into_iter()
            .filter_map(|id| {
                inner
                    .registry
                    .get(&id)
                    .map(|conn| (id, conn.sender().clone()))
            })
            .collect()
    }

    /// Senders for the given ids; unknown ids are skipped.
    pub fn senders_for(&self, ids: &[ConnectionId]) -> Vec<(ConnectionId, ConnectionSender)> {
        let inner = self.inner.lock();
        ids.iter()
            .filter_map(|id| {
                inner
                    .registry
                    .get(id)
                    .map(|conn| (*id, conn.sender().clone()))
            })
            .collect()
    }

    pub fn all_senders(&self) -> Vec<(ConnectionId, ConnectionSender)> {
        self.inner
            .lock()
            .registry
            .iter()
            .map(|conn| (conn.id, conn.sender().clone()))
            .collect()
    }

    /// Unregister every connection silent for longer than `timeout` as of
    /// `now`. Staleness is decided and the connections removed under one lock,
    /// so a frame arriving mid-sweep cannot be evicted by an old reading.
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let evicted = {
            let mut inner = self.inner.lock();
            let HubInner { registry, index } = &mut *inner;
            let stale = registry.stale(now, timeout);
            stale
                .into_iter()
                .filter_map(|id| registry.remove(&id))
                .map(|mut conn| {
                    index.remove_connection(&mut conn);
                    conn
                })
                .collect::<Vec<_>>()
        };

        evicted
            .into_iter()
            .map(|conn| {
                conn.close(CLOSE_GOING_AWAY, "heartbeat timeout");
                conn.id
            })
            .collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().registry.iter().map(|conn| conn.id).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.lock().index.topic_count()
    }

    pub fn topics_of(&self, id: &ConnectionId) -> Vec<Topic> {
        self.connection(id)
            .map(|info| info.subscribed_topics)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    fn identity(n: i64) -> Identity {
        Identity {
            user_id: format!("user-{n}"),
            player_number: n,
            username: format!("player{n}"),
        }
    }

    #[test]
    fn test_unregister_cascades_into_index() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _token) = hub.register(tx);

        hub.subscribe(&id, "week-5").unwrap();
        hub.subscribe(&id, "week-6").unwrap();
        assert_eq!(hub.topic_count(), 2);

        assert!(hub.unregister(&id));
        assert!(hub.members_of("week-5").is_empty());
        assert!(hub.members_of("week-6").is_empty());
        assert_eq!(hub.topic_count(), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _token) = hub.register(tx);

        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
    }

    #[test]
    fn test_unregister_closes_transport() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, token) = hub.register(tx);

        hub.unregister_with(&id, CLOSE_GOING_AWAY, "heartbeat timeout");

        assert!(token.is_cancelled());
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CLOSE_GOING_AWAY);
                assert_eq!(frame.reason.as_str(), "heartbeat timeout");
            }
            other => panic!("Expected close frame, got: {:?}", other),
        }
    }

    #[test]
    fn test_operations_on_unknown_connection() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _token) = hub.register(tx);
        hub.unregister(&id);

        assert_eq!(hub.subscribe(&id, "week-1"), Err(NotConnected(id)));
        assert_eq!(hub.unsubscribe(&id, "week-1"), Err(NotConnected(id)));
        assert!(hub.set_identity(&id, identity(1)).is_err());
        assert!(!hub.touch(&id));
        assert!(hub.connection(&id).is_none());
        assert!(hub.members_of("week-1").is_empty());
    }

    #[test]
    fn test_latest_identity_wins() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _token) = hub.register(tx);

        assert!(!hub.connection(&id).unwrap().authenticated);
        hub.set_identity(&id, identity(1)).unwrap();
        hub.set_identity(&id, identity(2)).unwrap();

        let info = hub.connection(&id).unwrap();
        assert!(info.authenticated);
        assert_eq!(info.identity, Some(identity(2)));
    }

    #[test]
    fn test_index_mirrors_connection_topics() {
        let hub = Hub::new();
        let ids: Vec<ConnectionId> = (0..8)
            .map(|_| {
                let (tx, _rx) = mpsc::unbounded_channel();
                hub.register(tx).0
            })
            .collect();

        for (i, id) in ids.iter().enumerate() {
            for week in 0..4 {
                if (i + week) % 2 == 0 {
                    hub.subscribe(id, &format!("week-{week}")).unwrap();
                }
            }
        }
        for id in ids.iter().step_by(3) {
            hub.unsubscribe(id, "week-0").unwrap();
        }
        hub.unregister(&ids[4]);

        for week in 0..4 {
            let topic = format!("week-{week}");
            let members = hub.members_of(&topic);
            for id in &ids {
                let mirrored = hub.topics_of(id).contains(&topic);
                assert_eq!(members.contains(id), mirrored, "{topic} out of sync");
            }
        }
    }

    #[test]
    fn test_concurrent_subscribe_and_unregister() {
        let hub = std::sync::Arc::new(Hub::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (tx, _rx) = mpsc::unbounded_channel();
                        let (id, _token) = hub.register(tx);
                        hub.subscribe(&id, "week-1").unwrap();
                        hub.subscribe(&id, "week-2").unwrap();
                        hub.unregister(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.topic_count(), 0);
    }
}
