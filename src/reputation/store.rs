//! Reputation persistence: score rows and the append-only event log.
//!
//! The `(community_id, event_id)` primary key on the event log is the
//! idempotency guard: replays of the same source event insert-conflict and
//! surface as `DuplicateEvent` before any score mutation happens.

use crate::db::{Db, format_ts};
use crate::error::{ReputationError, Result};
use crate::reputation::tiers::clamp_score;

use sqlx::Row as _;

/// One `(community, user)` reputation row.
#[derive(Debug, Clone)]
pub struct ReputationRow {
    pub community_id: i64,
    pub user_id: String,
    pub score: f64,
    pub total_events: i64,
    pub banned: bool,
    pub last_activity: String,
}

/// Result of atomically applying one event.
#[derive(Debug, Clone, Copy)]
pub struct ApplyResult {
    pub new_score: f64,
    pub previous_score: f64,
    pub total_events: i64,
    pub was_banned: bool,
}

#[derive(Clone)]
pub struct ReputationStore {
    db: Db,
}

impl ReputationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Read the current row, if any. Uses the replica pool when configured.
    pub async fn load(&self, community_id: i64, user_id: &str) -> Result<Option<ReputationRow>> {
        let row = sqlx::query(
            "SELECT community_id, user_id, score, total_events, banned, last_activity \
             FROM reputation WHERE community_id = $1 AND user_id = $2",
        )
        .bind(community_id)
        .bind(user_id)
        .fetch_optional(self.db.read())
        .await?;

        Ok(row.map(|row| ReputationRow {
            community_id: row.get("community_id"),
            user_id: row.get("user_id"),
            score: row.get("score"),
            total_events: row.get("total_events"),
            banned: row.get::<i64, _>("banned") != 0,
            last_activity: row.get("last_activity"),
        }))
    }

    /// Atomically: append the event-log row (deduplicating on the primary
    /// key), load-or-create the reputation row, apply the clamped delta, and
    /// bump counters. Returns `DuplicateEvent` without side-effects on replay.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_event(
        &self,
        community_id: i64,
        user_id: &str,
        entity_id: &str,
        event_id: &str,
        event_name: &str,
        delta: f64,
        event_data: &serde_json::Value,
        default_score: f64,
        min_score: f64,
        max_score: f64,
    ) -> Result<ApplyResult> {
        let now = format_ts(chrono::Utc::now());
        let mut tx = self.db.write().begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO events \
             (community_id, event_id, user_id, entity_id, event_name, event_score, event_data, processed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(community_id)
        .bind(event_id)
        .bind(user_id)
        .bind(entity_id)
        .bind(event_name)
        .bind(delta)
        .bind(event_data.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await;

        if let Err(error) = inserted {
            if is_unique_violation(&error) {
                return Err(ReputationError::DuplicateEvent {
                    community_id,
                    event_id: event_id.to_string(),
                }
                .into());
            }
            return Err(error.into());
        }

        let current = sqlx::query(
            "SELECT score, total_events, banned FROM reputation \
             WHERE community_id = $1 AND user_id = $2",
        )
        .bind(community_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (previous_score, total_events, was_banned) = match &current {
            Some(row) => (
                row.get::<f64, _>("score"),
                row.get::<i64, _>("total_events"),
                row.get::<i64, _>("banned") != 0,
            ),
            None => (default_score, 0, false),
        };

        let new_score = clamp_score(previous_score + delta, min_score, max_score);
        let total_events = total_events + 1;

        sqlx::query(
            "INSERT INTO reputation (community_id, user_id, score, total_events, banned, last_activity) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (community_id, user_id) DO UPDATE SET \
             score = $7, total_events = $8, last_activity = $9",
        )
        .bind(community_id)
        .bind(user_id)
        .bind(new_score)
        .bind(total_events)
        .bind(was_banned as i64)
        .bind(&now)
        .bind(new_score)
        .bind(total_events)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ApplyResult {
            new_score,
            previous_score,
            total_events,
            was_banned,
        })
    }

    /// Mark a user banned so the auto-ban policy fires at most once.
    pub async fn set_banned(&self, community_id: i64, user_id: &str, banned: bool) -> Result<()> {
        sqlx::query("UPDATE reputation SET banned = $1 WHERE community_id = $2 AND user_id = $3")
            .bind(banned as i64)
            .bind(community_id)
            .bind(user_id)
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    /// Moderation events (warn/timeout/kick/ban) recorded for a user since
    /// `since`, driving the escalation ladder. Decayed warnings fall out of
    /// the window naturally.
    pub async fn moderation_count_since(
        &self,
        community_id: i64,
        user_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM events \
             WHERE community_id = $1 AND user_id = $2 \
             AND event_name IN ('warn', 'timeout', 'kick', 'ban') \
             AND processed_at >= $3",
        )
        .bind(community_id)
        .bind(user_id)
        .bind(format_ts(since))
        .fetch_one(self.db.read())
        .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => {
            matches!(db_error.kind(), sqlx::error::ErrorKind::UniqueViolation)
                // The Any driver does not always classify; fall back to the
                // backend message.
                || db_error.message().to_ascii_lowercase().contains("unique")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::error::Error;

    fn store(db: Db) -> ReputationStore {
        ReputationStore::new(db)
    }

    #[tokio::test]
    async fn first_event_creates_row_with_default_base() {
        let store = store(test_db().await);
        let result = store
            .apply_event(
                1,
                "u1",
                "twitch:foo:1",
                "evt-1",
                "chat_message",
                0.01,
                &serde_json::json!({}),
                600.0,
                300.0,
                850.0,
            )
            .await
            .unwrap();

        assert_eq!(result.new_score, 600.01);
        assert_eq!(result.previous_score, 600.0);
        assert_eq!(result.total_events, 1);
        assert!(!result.was_banned);
    }

    #[tokio::test]
    async fn replayed_event_id_is_rejected_without_side_effects() {
        let store = store(test_db().await);
        store
            .apply_event(
                1,
                "u1",
                "e",
                "evt-dup",
                "follow",
                1.0,
                &serde_json::json!({}),
                600.0,
                300.0,
                850.0,
            )
            .await
            .unwrap();

        let error = store
            .apply_event(
                1,
                "u1",
                "e",
                "evt-dup",
                "follow",
                1.0,
                &serde_json::json!({}),
                600.0,
                300.0,
                850.0,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::Reputation(ReputationError::DuplicateEvent { .. })
        ));

        let row = store.load(1, "u1").await.unwrap().unwrap();
        assert_eq!(row.score, 601.0);
        assert_eq!(row.total_events, 1);
    }

    #[tokio::test]
    async fn score_never_leaves_bounds() {
        let store = store(test_db().await);
        for i in 0..5 {
            let result = store
                .apply_event(
                    1,
                    "u1",
                    "e",
                    &format!("evt-{i}"),
                    "ban",
                    -200.0,
                    &serde_json::json!({}),
                    600.0,
                    300.0,
                    850.0,
                )
                .await
                .unwrap();
            assert!(result.new_score >= 300.0);
        }
        let row = store.load(1, "u1").await.unwrap().unwrap();
        assert_eq!(row.score, 300.0);

        for i in 0..30 {
            let result = store
                .apply_event(
                    1,
                    "u1",
                    "e",
                    &format!("up-{i}"),
                    "sub_tier3",
                    20.0,
                    &serde_json::json!({}),
                    600.0,
                    300.0,
                    850.0,
                )
                .await
                .unwrap();
            assert!(result.new_score <= 850.0);
        }
        let row = store.load(1, "u1").await.unwrap().unwrap();
        assert_eq!(row.score, 850.0);
    }

    #[tokio::test]
    async fn moderation_window_counts_only_moderation_events() {
        let store = store(test_db().await);
        let base = chrono::Utc::now() - chrono::Duration::hours(1);

        for (i, name) in ["warn", "timeout", "chat_message"].iter().enumerate() {
            store
                .apply_event(
                    1,
                    "u1",
                    "e",
                    &format!("mod-{i}"),
                    name,
                    -1.0,
                    &serde_json::json!({}),
                    600.0,
                    300.0,
                    850.0,
                )
                .await
                .unwrap();
        }

        let count = store.moderation_count_since(1, "u1", base).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn communities_are_isolated() {
        let store = store(test_db().await);
        store
            .apply_event(1, "u1", "e", "a", "follow", 1.0, &serde_json::json!({}), 600.0, 300.0, 850.0)
            .await
            .unwrap();
        // Same event id, different community: not a duplicate.
        store
            .apply_event(2, "u1", "e", "a", "follow", 1.0, &serde_json::json!({}), 600.0, 300.0, 850.0)
            .await
            .unwrap();

        assert_eq!(store.load(1, "u1").await.unwrap().unwrap().score, 601.0);
        assert_eq!(store.load(2, "u1").await.unwrap().unwrap().score, 601.0);
    }
}
