use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::migrations;
use super::{hash_pin, week_of, topic_for_week};
use super::{Identity, PredictionStore, StoreError, Submission, SubmitOutcome};

/// Type alias for the shared database connection.
/// rusqlite is synchronous, so the connection sits behind Arc<Mutex>
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// `PredictionStore` over the platform's SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    /// Open (or create) `pickem.db` in `data_dir`, enable WAL mode, and run
    /// migrations.
    pub fn open(data_dir: &str) -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(data_dir)?;

        let db_path = Path::new(data_dir).join("pickem.db");
        let mut conn = Connection::open(&db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::migrations().to_latest(&mut conn)?;

        tracing::info!("Database initialized at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert_user(&self, user: &Identity, pin: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, player_number, username, pin_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                user.user_id,
                user.player_number,
                user.username,
                hash_pin(pin),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn insert_prediction(
        &self,
        id: &str,
        week: i64,
        home_team: &str,
        away_team: &str,
        kickoff_at: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO predictions (id, week, home_team, away_team, kickoff_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, week, home_team, away_team, kickoff_at],
        )?;
        Ok(())
    }

    pub fn set_locked(&self, id: &str, locked: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE predictions SET locked = ?2 WHERE id = ?1",
            rusqlite::params![id, locked],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))
    }

    /// Run a query on the blocking pool.
    async fn run<T, F>(&self, query: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))?;
            query(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?
    }
}

/// Pick counts per choice for one prediction.
fn tally(conn: &Connection, prediction_id: &str) -> rusqlite::Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT choice, COUNT(*) FROM picks WHERE prediction_id = ?1
         GROUP BY choice ORDER BY choice",
    )?;
    let counts = stmt
        .query_map([prediction_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tally = Map::new();
    for (choice, count) in counts {
        tally.insert(choice, json!(count));
    }
    Ok(Value::Object(tally))
}

#[async_trait]
impl PredictionStore for SqliteStore {
    async fn authenticate(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let identity = identity.to_string();
        let hashed = hash_pin(secret);

        self.run(move |conn| {
            let player_number = identity.parse::<i64>().ok();
            let row = conn
                .query_row(
                    "SELECT id, player_number, username, pin_hash FROM users
                     WHERE username = ?1 OR player_number = ?2",
                    rusqlite::params![identity, player_number],
                    |row| {
                        Ok((
                            Identity {
                                user_id: row.get(0)?,
                                player_number: row.get(1)?,
                                username: row.get(2)?,
                            },
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            Ok(row.and_then(|(user, pin_hash)| (pin_hash == hashed).then_some(user)))
        })
        .await
    }

    async fn submit(
        &self,
        user: &Identity,
        submission: &Submission,
    ) -> Result<SubmitOutcome, StoreError> {
        let user_id = user.user_id.clone();
        let submission = submission.clone();

        self.run(move |conn| {
            let tx = conn.transaction()?;

            let known_user = tx
                .query_row("SELECT 1 FROM users WHERE id = ?1", [&user_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !known_user {
                return Err(StoreError::Rejected("unknown player".to_string()));
            }

            let game = tx
                .query_row(
                    "SELECT week, home_team, away_team, locked FROM predictions WHERE id = ?1",
                    [&submission.prediction_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((week, home_team, away_team, locked)) = game else {
                return Err(StoreError::Rejected(format!(
                    "unknown prediction {}",
                    submission.prediction_id
                )));
            };
            if locked {
                return Err(StoreError::Rejected("prediction is locked".to_string()));
            }
            if submission.choice != home_team && submission.choice != away_team {
                return Err(StoreError::Rejected(format!(
                    "choice must be {} or {}",
                    home_team, away_team
                )));
            }

            let submitted_at = Utc::now();
            tx.execute(
                "INSERT INTO picks (user_id, prediction_id, choice, confidence, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, prediction_id) DO UPDATE SET
                     choice = excluded.choice,
                     confidence = excluded.confidence,
                     note = excluded.note,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    user_id,
                    submission.prediction_id,
                    submission.choice,
                    submission.confidence,
                    submission.note,
                    submitted_at.to_rfc3339()
                ],
            )?;
            let tally = tally(&tx, &submission.prediction_id)?;
            tx.commit()?;

            Ok(SubmitOutcome {
                topic: topic_for_week(week),
                prediction_id: submission.prediction_id,
                choice: submission.choice,
                confidence: submission.confidence,
                submitted_at,
                tally,
            })
        })
        .await
    }

    async fn fetch_current_state(&self, topic: &str) -> Result<Value, StoreError> {
        let topic = topic.to_string();
        let Some(week) = week_of(&topic) else {
            return Ok(json!({ "topic": topic, "predictions": [] }));
        };

        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.home_team, p.away_team, p.kickoff_at, p.locked,
                        (SELECT COUNT(*) FROM picks WHERE prediction_id = p.id),
                        (SELECT MAX(updated_at) FROM picks WHERE prediction_id = p.id)
                 FROM predictions p WHERE p.week = ?1
                 ORDER BY p.kickoff_at, p.id",
            )?;
            let rows = stmt
                .query_map([week], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        json!({
                            "id": row.get::<_, String>(0)?,
                            "homeTeam": row.get::<_, String>(1)?,
                            "awayTeam": row.get::<_, String>(2)?,
                            "kickoffAt": row.get::<_, Option<String>>(3)?,
                            "locked": row.get::<_, bool>(4)?,
                            "picks": row.get::<_, i64>(5)?,
                            "lastPickAt": row.get::<_, Option<String>>(6)?,
                        }),
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut predictions = Vec::with_capacity(rows.len());
            for (id, mut game) in rows {
                game["tally"] = tally(conn, &id)?;
                predictions.push(game);
            }

            Ok(json!({ "topic": topic, "week": week, "predictions": predictions }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dave() -> Identity {
        Identity {
            user_id: "u-dave".to_string(),
            player_number: 21,
            username: "Dave".to_string(),
        }
    }

    fn pick(prediction_id: &str, choice: &str, confidence: u32) -> Submission {
        Submission {
            prediction_id: prediction_id.to_string(),
            choice: choice.to_string(),
            confidence,
            note: Some("gut feeling".to_string()),
        }
    }

    fn open_store() -> (SqliteStore, tempfile::TempDir) {
        let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqliteStore::open(tmp_dir.path().to_str().unwrap()).expect("open store");
        store.insert_user(&dave(), "2121").unwrap();
        store
            .insert_prediction("g1", 5, "KC", "BUF", Some("2026-10-11T17:00:00Z"))
            .unwrap();
        store
            .insert_prediction("g2", 5, "DAL", "NYG", Some("2026-10-11T20:25:00Z"))
            .unwrap();
        store.insert_prediction("g3", 6, "SF", "SEA", None).unwrap();
        (store, tmp_dir)
    }

    #[tokio::test]
    async fn test_authenticate_by_username_or_number() {
        let (store, _tmp) = open_store();

        assert_eq!(store.authenticate("dave", "2121").await.unwrap(), Some(dave()));
        assert_eq!(store.authenticate("21", "2121").await.unwrap(), Some(dave()));
        assert_eq!(store.authenticate("dave", "0000").await.unwrap(), None);
        assert_eq!(store.authenticate("erin", "2121").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_submit_upserts_and_tallies() {
        let (store, _tmp) = open_store();

        let outcome = store.submit(&dave(), &pick("g1", "KC", 16)).await.unwrap();
        assert_eq!(outcome.topic, "week-5");
        assert_eq!(outcome.tally, json!({"KC": 1}));

        let outcome = store.submit(&dave(), &pick("g1", "BUF", 3)).await.unwrap();
        assert_eq!(outcome.confidence, 3);
        assert_eq!(outcome.tally, json!({"BUF": 1}));
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let (store, _tmp) = open_store();
        store.set_locked("g2", true).unwrap();

        for (submission, user) in [
            (pick("missing", "KC", 1), dave()),
            (pick("g2", "DAL", 1), dave()),
            (pick("g1", "SEA", 1), dave()),
            (
                pick("g1", "KC", 1),
                Identity {
                    user_id: "ghost".to_string(),
                    player_number: 99,
                    username: "ghost".to_string(),
                },
            ),
        ] {
            let result = store.submit(&user, &submission).await;
            assert!(
                matches!(result, Err(StoreError::Rejected(_))),
                "expected rejection for {:?}",
                submission
            );
        }
    }

    #[tokio::test]
    async fn test_snapshot_for_week() {
        let (store, _tmp) = open_store();
        store.submit(&dave(), &pick("g2", "NYG", 7)).await.unwrap();

        let state = store.fetch_current_state("week-5").await.unwrap();
        assert_eq!(state["week"], 5);
        let predictions = state["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0]["id"], "g1");
        assert_eq!(predictions[0]["picks"], 0);
        assert_eq!(predictions[1]["tally"]["NYG"], 1);
        assert!(predictions[1]["lastPickAt"].is_string());

        let other = store.fetch_current_state("preseason").await.unwrap();
        assert_eq!(other["predictions"], json!([]));
    }
}
