use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// Transport-level ceiling as a multiple of the protocol frame limit. Frames
/// between the two get a `frame-too-large` error; beyond it the socket drops.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// GET /ws
/// WebSocket upgrade endpoint. Connections open anonymous and authenticate
/// in-band, so the upgrade itself is unconditional.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hard_cap = state
        .settings
        .max_frame_bytes
        .saturating_mul(TRANSPORT_LIMIT_FACTOR);
    // Upgraded sockets leave hyper's view; the tracker lets shutdown wait on them
    let tasks = state.tasks.clone();

    ws.max_message_size(hard_cap)
        .max_frame_size(hard_cap)
        .on_upgrade(move |socket| tasks.track_future(actor::run_connection(socket, state)))
}
