use super::hub::{Hub, CLOSE_GOING_AWAY};
use super::protocol::ServerMessage;
use super::{ConnectionId, ConnectionSender};

/// Who a fan-out reached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<ConnectionId>,
    /// Connections whose send failed; they have been unregistered.
    pub failed: Vec<ConnectionId>,
}

/// Send `message` to every current member of `topic`.
pub fn broadcast_to_topic(hub: &Hub, topic: &str, message: &ServerMessage) -> DeliveryReport {
    let report = deliver(hub, hub.topic_senders(topic), message);
    tracing::debug!(
        topic = %topic,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Broadcast to topic"
    );
    report
}

/// Send `message` to specific connections. Ids that are no longer registered
/// are skipped.
pub fn broadcast_to_connections(
    hub: &Hub,
    ids: &[ConnectionId],
    message: &ServerMessage,
) -> DeliveryReport {
    deliver(hub, hub.senders_for(ids), message)
}

/// Send `message` to every live connection. Reserved for system-wide
/// announcements; topic updates go through `broadcast_to_topic`.
pub fn broadcast_to_all(hub: &Hub, message: &ServerMessage) -> DeliveryReport {
    let report = deliver(hub, hub.all_senders(), message);
    tracing::info!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Broadcast to all connections"
    );
    report
}

/// Queue a direct reply on one connection's channel.
pub fn send_message(tx: &ConnectionSender, message: &ServerMessage) -> bool {
    match message.to_ws() {
        Ok(frame) => tx.send(frame).is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode outbound message");
            false
        }
    }
}

/// Best-effort, at-most-once delivery. A failed send means the connection's
/// writer is gone, so the connection is unregistered after the loop; it never
/// stops delivery to the others.
fn deliver(
    hub: &Hub,
    targets: Vec<(ConnectionId, ConnectionSender)>,
    message: &ServerMessage,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let frame = match message.to_ws() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode broadcast message");
            return report;
        }
    };

    for (id, sender) in targets {
        if sender.send(frame.clone()).is_ok() {
            report.delivered.push(id);
        } else {
            report.failed.push(id);
        }
    }

    for id in &report.failed {
        tracing::warn!(connection_id = %id, "Send failed, dropping connection");
        hub.unregister_with(id, CLOSE_GOING_AWAY, "send failed");
    }

    report
}
