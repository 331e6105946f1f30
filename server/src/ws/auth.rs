//! In-band authentication: promotes an open connection from anonymous to
//! identified. Holds no state of its own beyond the identity it writes into
//! the hub.

use crate::auth::jwt;
use crate::state::AppState;
use crate::store::{self, Identity, StoreError};

use super::protocol::{Credentials, ErrorCode};
use super::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("authentication is temporarily unavailable")]
    StoreUnavailable,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidCredentials => ErrorCode::InvalidCredentials,
            AuthError::StoreUnavailable => ErrorCode::StoreUnavailable,
        }
    }
}

/// Check `credentials` and, on success, mark the connection authenticated.
/// On failure the connection is left untouched. Re-authenticating replaces
/// the previous identity.
pub async fn authenticate(
    state: &AppState,
    connection_id: ConnectionId,
    credentials: &Credentials,
) -> Result<Identity, AuthError> {
    let identity = resolve(state, credentials).await.inspect_err(|err| {
        tracing::warn!(
            connection_id = %connection_id,
            error = %err,
            "Authentication failed"
        );
    })?;

    if state.hub.set_identity(&connection_id, identity.clone()).is_err() {
        // Disconnected while the store call was in flight; nothing to promote.
        tracing::debug!(connection_id = %connection_id, "Authenticated a closed connection");
    } else {
        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            username = %identity.username,
            "Connection authenticated"
        );
    }
    Ok(identity)
}

async fn resolve(state: &AppState, credentials: &Credentials) -> Result<Identity, AuthError> {
    match credentials {
        Credentials::Token { token } => {
            let secret = state
                .jwt_secret
                .as_deref()
                .ok_or(AuthError::InvalidCredentials)?;
            jwt::validate_session_token(secret, token).map_err(|_| AuthError::InvalidCredentials)
        }
        Credentials::Pin { identity, pin } => {
            let lookup = state.store.authenticate(identity.trim(), pin);
            match store::with_timeout(state.settings.store_timeout, lookup).await {
                Ok(Some(identity)) => Ok(identity),
                Ok(None) | Err(StoreError::Rejected(_)) => Err(AuthError::InvalidCredentials),
                Err(err) => {
                    tracing::warn!(error = %err, "Store error during authentication");
                    Err(AuthError::StoreUnavailable)
                }
            }
        }
    }
}
