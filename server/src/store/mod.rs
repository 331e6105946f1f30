//! The external prediction store as seen from the hub.
//!
//! The hub only ever calls the three operations on `PredictionStore`; the
//! adapters here (SQLite and in-memory) are interchangeable behind it.

pub mod memory;
pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A user resolved by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub player_number: i64,
    pub username: String,
}

/// A pick sent over `submit-prediction`, already validated for shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub prediction_id: String,
    pub choice: String,
    pub confidence: u32,
    pub note: Option<String>,
}

/// What the store recorded for a submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Topic the prediction belongs to, as decided by the store.
    pub topic: String,
    pub prediction_id: String,
    pub choice: String,
    pub confidence: u32,
    pub submitted_at: DateTime<Utc>,
    /// Pick counts per choice for this prediction after the write.
    pub tally: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    /// The store refused the request (unknown prediction, locked, bad choice).
    #[error("{0}")]
    Rejected(String),
    #[error("store error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait PredictionStore: Send + Sync + 'static {
    /// Resolve `identity` (username or player number) and `secret` (PIN) to a
    /// user. `Ok(None)` means the credentials did not match.
    async fn authenticate(&self, identity: &str, secret: &str)
        -> Result<Option<Identity>, StoreError>;

    /// Record `user`'s pick. The returned outcome names the topic to notify.
    async fn submit(&self, user: &Identity, submission: &Submission)
        -> Result<SubmitOutcome, StoreError>;

    /// Current state of a topic, sent to clients right after they subscribe.
    async fn fetch_current_state(&self, topic: &str) -> Result<serde_json::Value, StoreError>;
}

pub type SharedStore = Arc<dyn PredictionStore>;

/// Run a store call with a deadline. An elapsed deadline is `StoreError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

/// SHA-256 hex digest of a PIN, the form PINs are stored in.
pub fn hash_pin(pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

/// Week number encoded in a topic such as `week-5`.
pub fn week_of(topic: &str) -> Option<i64> {
    topic.strip_prefix("week-")?.parse().ok()
}

pub fn topic_for_week(week: i64) -> String {
    format!("week-{week}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_topic_mapping() {
        assert_eq!(week_of("week-5"), Some(5));
        assert_eq!(week_of(&topic_for_week(17)), Some(17));
        assert_eq!(week_of("week-"), None);
        assert_eq!(week_of("playoffs"), None);
    }

    #[test]
    fn test_hash_pin_is_hex_sha256() {
        let hash = hash_pin("1234");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_pin("1234"));
        assert_ne!(hash, hash_pin("4321"));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(())
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(StoreError::Timeout)));

        let fast = async { Ok::<_, StoreError>(7) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
