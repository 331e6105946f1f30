//! Graceful shutdown: tell every client, close every socket, then wait for
//! the connection actors to flush what they queued.

use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::ws::broadcast::broadcast_to_all;
use crate::ws::hub::{Hub, CLOSE_GOING_AWAY};
use crate::ws::protocol::ServerMessage;

pub const SHUTDOWN_MESSAGE: &str = "server is shutting down";

/// Send the shutdown announcement to every connection, then close each one
/// with 1001. Returns how many connections were closed.
pub fn announce_and_close(hub: &Hub) -> usize {
    broadcast_to_all(
        hub,
        &ServerMessage::Announcement {
            message: SHUTDOWN_MESSAGE.to_string(),
        },
    );

    let ids = hub.connection_ids();
    for id in &ids {
        hub.unregister_with(id, CLOSE_GOING_AWAY, "server shutdown");
    }
    ids.len()
}

/// Wait up to `grace` for every tracked connection actor to finish. Returns
/// false if some were still running when the grace period ran out.
pub async fn drain(tasks: &TaskTracker, grace: Duration) -> bool {
    tasks.close();
    let drained = tokio::time::timeout(grace, tasks.wait()).await.is_ok();
    if drained {
        tracing::info!("All connections drained");
    } else {
        tracing::warn!(
            remaining = tasks.len(),
            grace_secs = grace.as_secs_f64(),
            "Connections still open after shutdown grace period"
        );
    }
    drained
}
