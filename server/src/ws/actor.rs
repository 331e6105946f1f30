use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::state::AppState;
use crate::ws::broadcast::send_message;
use crate::ws::protocol::ServerMessage;
use crate::ws::router;
use crate::ws::{ConnectionId, ConnectionSender};

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the actor-per-connection pattern for one WebSocket.
///
/// The socket is served by three parts:
/// - Reader loop: records liveness as each frame arrives and hands data
///   frames to the dispatch task
/// - Dispatch task: handles data frames one at a time, in arrival order
/// - Writer task: owns the sink, forwards messages from an mpsc channel
///
/// A slow store call therefore delays replies but never the liveness
/// timestamp. The connection starts anonymous; clients authenticate in-band.
/// The hub holds a clone of the sender so broadcasts reach this client, and a
/// cancellation token so eviction can stop the reader.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Message>();

    let (connection_id, shutdown) = state.hub.register(tx.clone());
    tracing::info!(
        connection_id = %connection_id,
        connections = state.hub.connection_count(),
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    send_message(&tx, &ServerMessage::connected(connection_id));

    let dispatch_handle = tokio::spawn(dispatch_task(
        frame_rx,
        tx.clone(),
        state.clone(),
        connection_id,
    ));

    // Reader loop: process incoming WebSocket messages
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Connection closed by hub");
                break;
            }
            next = ws_receiver.next() => next,
        };

        // Any inbound frame counts as liveness, stamped on arrival
        state.hub.touch(&connection_id);

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(_) | Message::Binary(_) => {
                    if frame_tx.send(msg).is_err() {
                        break;
                    }
                }
                // tungstenite queues the Pong reply itself
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended, client disconnected
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Frames read before the disconnect are still handled, with the identity
    // the connection had; their store writes and broadcasts go through.
    drop(frame_tx);
    if let Err(e) = dispatch_handle.await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Dispatch task failed");
    }

    // No-op if the hub already dropped this connection (eviction, send failure)
    state.hub.unregister(&connection_id);

    // The hub's sender clone is gone; dropping ours lets the writer drain and exit
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::info!(
        connection_id = %connection_id,
        connections = state.hub.connection_count(),
        "WebSocket actor stopped"
    );
}

/// Dispatch task: routes data frames to the protocol handlers, in order.
async fn dispatch_task(
    mut frames: mpsc::UnboundedReceiver<Message>,
    tx: ConnectionSender,
    state: AppState,
    connection_id: ConnectionId,
) {
    while let Some(msg) = frames.recv().await {
        match msg {
            Message::Text(text) => {
                router::handle_text_frame(text.as_str(), &tx, &state, connection_id).await;
            }
            Message::Binary(data) => {
                router::handle_binary_frame(&data, &tx, &state, connection_id).await;
            }
            _ => {}
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
/// Stops after a close frame is written.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
