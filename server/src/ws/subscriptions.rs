use std::collections::{HashMap, HashSet};

use super::connection::Connection;
use super::{ConnectionId, Topic};

/// Topic -> subscribed connection ids.
///
/// Every mutation takes the `Connection` as well and updates its
/// `subscribed_topics` mirror in the same call, so `id ∈ index[topic]` holds
/// exactly when `topic ∈ connection.subscribed_topics`. Empty topics are pruned.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: HashMap<Topic, HashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `topic`. Returns false if it was already a member.
    pub fn subscribe(&mut self, conn: &mut Connection, topic: &str) -> bool {
        let added = self
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn.id);
        conn.subscribed_topics.insert(topic.to_string());
        added
    }

    /// Remove `conn` from `topic`. Returns false if it was not a member.
    pub fn unsubscribe(&mut self, conn: &mut Connection, topic: &str) -> bool {
        conn.subscribed_topics.remove(topic);
        self.remove_member(topic, &conn.id)
    }

    /// Drop every membership of `conn`. Touches only the topics the
    /// connection had joined.
    pub fn remove_connection(&mut self, conn: &mut Connection) -> usize {
        let mut removed = 0;
        for topic in conn.subscribed_topics.drain() {
            if Self::remove_from(&mut self.topics, &topic, &conn.id) {
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot of the members of `topic`; empty for unknown topics.
    pub fn members_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, topic: &str, id: &ConnectionId) -> bool {
        self.topics
            .get(topic)
            .map(|members| members.contains(id))
            .unwrap_or(false)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn remove_member(&mut self, topic: &str, id: &ConnectionId) -> bool {
        Self::remove_from(&mut self.topics, topic, id)
    }

    fn remove_from(
        topics: &mut HashMap<Topic, HashSet<ConnectionId>>,
        topic: &str,
        id: &ConnectionId,
    ) -> bool {
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}
