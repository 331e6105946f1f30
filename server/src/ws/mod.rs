pub mod actor;
pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod subscriptions;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Type alias for the sender half of a WebSocket connection's channel.
/// The hub keeps a clone per connection so broadcasts can reach the client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Server-assigned identifier of one live connection.
pub type ConnectionId = Uuid;

/// Named channel of interest, e.g. `week-5`.
pub type Topic = String;
