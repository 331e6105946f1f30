use std::time::Instant;

use crate::state::AppState;
use crate::store::{self, StoreError, Submission};

use super::auth;
use super::broadcast::{broadcast_to_connections, broadcast_to_topic, send_message};
use super::protocol::{
    Command, Credentials, ErrorCode, Frame, ProtocolError, ServerMessage, StateChange,
};
use super::{ConnectionId, ConnectionSender};

/// Handle an inbound text frame: size check, parse, validate, dispatch.
/// Every failure is answered with an `error` frame; the connection stays open.
pub async fn handle_text_frame(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) {
    if !within_frame_limit(text.len(), tx, state, connection_id) {
        return;
    }

    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(
                connection_id = %connection_id,
                error = %err,
                "Failed to parse frame"
            );
            send_message(tx, &ServerMessage::protocol_error(None, &err));
            return;
        }
    };

    let request_id = frame.request_id.as_deref();
    match frame.validate() {
        Ok(command) => dispatch(command, request_id, tx, state, connection_id).await,
        Err(err) => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = %frame.kind,
                error = %err,
                "Rejected frame"
            );
            send_message(tx, &ServerMessage::protocol_error(request_id, &err));
        }
    }
}

/// Binary frames carry the same JSON, UTF-8 encoded.
pub async fn handle_binary_frame(
    data: &[u8],
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) {
    if !within_frame_limit(data.len(), tx, state, connection_id) {
        return;
    }
    match std::str::from_utf8(data) {
        Ok(text) => handle_text_frame(text, tx, state, connection_id).await,
        Err(e) => {
            let err = ProtocolError::Parse(format!("binary frame is not UTF-8: {e}"));
            send_message(tx, &ServerMessage::protocol_error(None, &err));
        }
    }
}

/// Answers oversized frames with `frame-too-large`; returns false for them.
fn within_frame_limit(
    size: usize,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) -> bool {
    let limit = state.settings.max_frame_bytes;
    if size <= limit {
        return true;
    }
    tracing::warn!(
        connection_id = %connection_id,
        size = size,
        limit = limit,
        "Frame too large"
    );
    let err = ProtocolError::FrameTooLarge { size, limit };
    send_message(tx, &ServerMessage::protocol_error(None, &err));
    false
}

async fn dispatch(
    command: Command,
    request_id: Option<&str>,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) {
    match command {
        Command::Heartbeat => {
            send_message(tx, &ServerMessage::heartbeat());
        }
        Command::Authenticate { credentials } => {
            authenticate(&credentials, request_id, tx, state, connection_id).await;
        }
        Command::Subscribe { topic, credentials } => {
            handle_subscribe(&topic, credentials, request_id, tx, state, connection_id).await;
        }
        Command::Unsubscribe { topic } => {
            // Idempotent and silent, including for topics never joined
            if let Ok(true) = state.hub.unsubscribe(&connection_id, &topic) {
                tracing::debug!(connection_id = %connection_id, topic = %topic, "Unsubscribed");
            }
        }
        Command::SubmitPrediction(submission) => {
            handle_submit(submission, request_id, tx, state, connection_id).await;
        }
    }
}

/// Run in-band authentication and reply with the outcome.
async fn authenticate(
    credentials: &Credentials,
    request_id: Option<&str>,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) -> bool {
    match auth::authenticate(state, connection_id, credentials).await {
        Ok(user) => {
            send_message(tx, &ServerMessage::authenticated(request_id, user));
            true
        }
        Err(err) => {
            send_message(
                tx,
                &ServerMessage::error(request_id, err.code(), err.to_string()),
            );
            false
        }
    }
}

/// Subscribe, then send the topic's current state to this connection only.
/// Reading a topic needs no identity, so failed inline credentials are
/// reported but do not block the subscription.
async fn handle_subscribe(
    topic: &str,
    credentials: Option<Credentials>,
    request_id: Option<&str>,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) {
    if let Some(credentials) = credentials {
        authenticate(&credentials, request_id, tx, state, connection_id).await;
    }

    match state.hub.subscribe(&connection_id, topic) {
        Ok(added) => {
            tracing::debug!(
                connection_id = %connection_id,
                topic = %topic,
                added = added,
                "Subscribed"
            );
        }
        Err(_) => return,
    }

    let started = Instant::now();
    let fetch = state.store.fetch_current_state(topic);
    match store::with_timeout(state.settings.store_timeout, fetch).await {
        Ok(snapshot) => {
            tracing::debug!(
                topic = %topic,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Fetched topic snapshot"
            );
            send_message(
                tx,
                &ServerMessage::StateSnapshot {
                    request_id: request_id.map(str::to_string),
                    topic: topic.to_string(),
                    state: snapshot,
                },
            );
        }
        Err(err) => {
            // Membership stands; live updates still flow once the store recovers
            tracing::warn!(topic = %topic, error = %err, "Snapshot fetch failed");
            send_message(
                tx,
                &ServerMessage::error(
                    request_id,
                    ErrorCode::StoreUnavailable,
                    format!("could not load current state for {topic}"),
                ),
            );
        }
    }
}

/// Persist a pick, fan the change out to the topic, then acknowledge the
/// submitter. Unauthenticated submissions never reach the store.
async fn handle_submit(
    submission: Submission,
    request_id: Option<&str>,
    tx: &ConnectionSender,
    state: &AppState,
    connection_id: ConnectionId,
) {
    let Some(user) = state.hub.identity(&connection_id) else {
        send_message(
            tx,
            &ServerMessage::error(
                request_id,
                ErrorCode::AuthenticationRequired,
                "authenticate before submitting predictions",
            ),
        );
        return;
    };

    let write = state.store.submit(&user, &submission);
    match store::with_timeout(state.settings.store_timeout, write).await {
        Ok(outcome) => {
            let topic = outcome.topic.clone();
            tracing::info!(
                connection_id = %connection_id,
                user_id = %user.user_id,
                topic = %topic,
                prediction_id = %outcome.prediction_id,
                "Prediction submitted"
            );
            let change = ServerMessage::StateChanged(StateChange::new(&user, outcome));
            broadcast_to_topic(&state.hub, &topic, &change);
            broadcast_to_connections(
                &state.hub,
                &[connection_id],
                &ServerMessage::status(request_id, "prediction submitted"),
            );
        }
        Err(StoreError::Rejected(reason)) => {
            tracing::debug!(
                connection_id = %connection_id,
                reason = %reason,
                "Submission rejected"
            );
            send_message(
                tx,
                &ServerMessage::error(request_id, ErrorCode::SubmissionRejected, reason),
            );
        }
        Err(err) => {
            tracing::warn!(
                connection_id = %connection_id,
                error = %err,
                "Store error during submission"
            );
            send_message(
                tx,
                &ServerMessage::error(
                    request_id,
                    ErrorCode::StoreUnavailable,
                    "prediction could not be saved, try again",
                ),
            );
        }
    }
}
