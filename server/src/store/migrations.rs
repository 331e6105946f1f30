use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: players, weekly slates and picks

CREATE TABLE users (
    id TEXT PRIMARY KEY,
    player_number INTEGER NOT NULL UNIQUE,
    username TEXT NOT NULL UNIQUE COLLATE NOCASE,
    pin_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE predictions (
    id TEXT PRIMARY KEY,
    week INTEGER NOT NULL,
    home_team TEXT NOT NULL,
    away_team TEXT NOT NULL,
    kickoff_at TEXT,
    locked INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_predictions_week ON predictions(week);

CREATE TABLE picks (
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    prediction_id TEXT NOT NULL REFERENCES predictions(id) ON DELETE CASCADE,
    choice TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    note TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, prediction_id)
);

CREATE INDEX idx_picks_prediction ON picks(prediction_id);
",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
