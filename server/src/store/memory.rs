//! In-process store for development runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{hash_pin, Identity, PredictionStore, StoreError, Submission, SubmitOutcome};

#[derive(Debug, Clone)]
struct UserRecord {
    identity: Identity,
    pin_hash: String,
}

/// A game in a week's slate.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub id: String,
    pub topic: String,
    pub home_team: String,
    pub away_team: String,
    pub locked: bool,
}

impl PredictionRecord {
    pub fn new(id: &str, topic: &str, home_team: &str, away_team: &str) -> Self {
        Self {
            id: id.to_string(),
            topic: topic.to_string(),
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            locked: false,
        }
    }
}

#[derive(Debug, Clone)]
struct PickRecord {
    choice: String,
    updated_at: DateTime<Utc>,
}

/// DashMap-backed `PredictionStore`.
///
/// `set_offline` and `set_delay` simulate an unreachable or slow backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// user_id -> record
    users: DashMap<String, UserRecord>,
    /// prediction_id -> record
    predictions: DashMap<String, PredictionRecord>,
    /// (prediction_id, user_id) -> pick
    picks: DashMap<(String, String), PickRecord>,
    offline: AtomicBool,
    delay_ms: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two players (PIN 1234) and a week-1 slate, for `--store memory` runs.
    pub fn with_demo_data() -> Self {
        let store = Self::new();
        for (n, name) in [(1, "alice"), (2, "bob")] {
            store.add_user(
                Identity {
                    user_id: format!("demo-{name}"),
                    player_number: n,
                    username: name.to_string(),
                },
                "1234",
            );
        }
        store.add_prediction(PredictionRecord::new("1", "week-1", "KC", "BAL"));
        store.add_prediction(PredictionRecord::new("2", "week-1", "PHI", "GB"));
        store.add_prediction(PredictionRecord::new("3", "week-1", "BUF", "ARI"));
        store
    }

    pub fn add_user(&self, identity: Identity, pin: &str) {
        self.users.insert(
            identity.user_id.clone(),
            UserRecord {
                identity,
                pin_hash: hash_pin(pin),
            },
        );
    }

    pub fn add_prediction(&self, record: PredictionRecord) {
        self.predictions.insert(record.id.clone(), record);
    }

    pub fn lock_prediction(&self, id: &str) {
        if let Some(mut record) = self.predictions.get_mut(id) {
            record.locked = true;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of picks written so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    async fn reachable(&self) -> Result<(), StoreError> {
        let delay = self.delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.offline.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn tally(&self, prediction_id: &str) -> Value {
        let mut counts: Map<String, Value> = Map::new();
        for entry in self.picks.iter() {
            if entry.key().0 != prediction_id {
                continue;
            }
            let count = counts
                .get(&entry.value().choice)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            counts.insert(entry.value().choice.clone(), json!(count + 1));
        }
        Value::Object(counts)
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn authenticate(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.reachable().await?;

        let player_number = identity.parse::<i64>().ok();
        let hashed = hash_pin(secret);
        let found = self.users.iter().find_map(|entry| {
            let user = entry.value();
            let matches = user.identity.username.eq_ignore_ascii_case(identity)
                || Some(user.identity.player_number) == player_number;
            (matches && user.pin_hash == hashed).then(|| user.identity.clone())
        });
        Ok(found)
    }

    async fn submit(
        &self,
        user: &Identity,
        submission: &Submission,
    ) -> Result<SubmitOutcome, StoreError> {
        self.reachable().await?;

        let prediction = self
            .predictions
            .get(&submission.prediction_id)
            .map(|record| record.value().clone())
            .ok_or_else(|| {
                StoreError::Rejected(format!("unknown prediction {}", submission.prediction_id))
            })?;
        if prediction.locked {
            return Err(StoreError::Rejected("prediction is locked".to_string()));
        }
        if submission.choice != prediction.home_team && submission.choice != prediction.away_team
        {
            return Err(StoreError::Rejected(format!(
                "choice must be {} or {}",
                prediction.home_team, prediction.away_team
            )));
        }

        let submitted_at = Utc::now();
        self.picks.insert(
            (prediction.id.clone(), user.user_id.clone()),
            PickRecord {
                choice: submission.choice.clone(),
                updated_at: submitted_at,
            },
        );
        self.writes.fetch_add(1, Ordering::AcqRel);

        Ok(SubmitOutcome {
            topic: prediction.topic,
            prediction_id: prediction.id.clone(),
            choice: submission.choice.clone(),
            confidence: submission.confidence,
            submitted_at,
            tally: self.tally(&prediction.id),
        })
    }

    async fn fetch_current_state(&self, topic: &str) -> Result<Value, StoreError> {
        self.reachable().await?;

        let mut games: Vec<PredictionRecord> = self
            .predictions
            .iter()
            .filter(|entry| entry.value().topic == topic)
            .map(|entry| entry.value().clone())
            .collect();
        games.sort_by(|a, b| a.id.cmp(&b.id));

        let predictions: Vec<Value> = games
            .iter()
            .map(|game| {
                let picks = self
                    .picks
                    .iter()
                    .filter(|entry| entry.key().0 == game.id)
                    .count();
                let last_pick_at = self
                    .picks
                    .iter()
                    .filter(|entry| entry.key().0 == game.id)
                    .map(|entry| entry.value().updated_at)
                    .max();
                json!({
                    "id": game.id,
                    "homeTeam": game.home_team,
                    "awayTeam": game.away_team,
                    "locked": game.locked,
                    "picks": picks,
                    "lastPickAt": last_pick_at,
                    "tally": self.tally(&game.id),
                })
            })
            .collect();

        Ok(json!({ "topic": topic, "predictions": predictions }))
    }
}
