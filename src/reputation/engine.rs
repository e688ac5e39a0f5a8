//! RecordEvent/GetScore orchestration and policy enforcement.

use crate::config::ReputationConfig;
use crate::db::Db;
use crate::error::{ReputationError, Result};
use crate::reputation::store::ReputationStore;
use crate::reputation::tiers::Tier;
use crate::reputation::weights::{WeightResolver, scale_delta, weight_event_name};
use crate::telemetry::Metrics;
use crate::{EventEnvelope, Platform, audit};

use async_trait::async_trait;
use std::sync::Arc;

/// Moderation side-effect the policy layer asks an action pusher to perform.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModerationRequest {
    pub platform: Platform,
    pub entity_id: String,
    pub community_id: i64,
    pub user_id: String,
    pub action: ModerationAction,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "minutes")]
pub enum ModerationAction {
    Ban,
    Timeout(u32),
}

/// Where moderation requests go. The action-pusher registry implements this;
/// tests plug in a recorder.
#[async_trait]
pub trait ModerationSink: Send + Sync + 'static {
    async fn request_moderation(&self, request: ModerationRequest) -> Result<()>;
}

/// Outcome returned to RecordEvent callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordOutcome {
    pub new_score: f64,
    pub tier: Tier,
    pub delta_applied: f64,
}

/// The reputation engine. One per process; cheap to share.
pub struct ReputationEngine {
    store: ReputationStore,
    resolver: WeightResolver,
    config: ReputationConfig,
    sink: Arc<dyn ModerationSink>,
    /// Redis list holding policy side-effects that failed to send.
    retry_queue: Option<deadpool_redis::Pool>,
}

impl ReputationEngine {
    pub fn new(
        db: Db,
        config: ReputationConfig,
        sink: Arc<dyn ModerationSink>,
        retry_queue: Option<deadpool_redis::Pool>,
    ) -> Self {
        let resolver = WeightResolver::new(db.clone(), config.weight_cache_ttl_secs);
        Self {
            store: ReputationStore::new(db),
            resolver,
            config,
            sink,
            retry_queue,
        }
    }

    /// Record one event: dedupe, resolve weight, scale, clamp, persist,
    /// enforce policy. Storage failures propagate (the stream entry stays
    /// unacked); policy failures never roll back the score.
    pub async fn record_event(&self, envelope: &EventEnvelope) -> Result<RecordOutcome> {
        self.record_event_as(envelope, weight_event_name(envelope))
            .await
    }

    /// Like [`record_event`] but with an explicit weight-table name. The
    /// router uses this to credit `command_usage` and `giveaway_entry`,
    /// which have no envelope event type of their own.
    ///
    /// [`record_event`]: ReputationEngine::record_event
    pub async fn record_event_as(
        &self,
        envelope: &EventEnvelope,
        event_name: &str,
    ) -> Result<RecordOutcome> {
        let community_id = community_of(envelope)?;

        let weight = self.resolver.resolve(community_id, event_name).await?;
        let delta = scale_delta(weight, envelope);

        let result = self
            .store
            .apply_event(
                community_id,
                &envelope.user_id,
                envelope.entity_id.as_str(),
                &envelope.event_id,
                event_name,
                delta,
                &serde_json::to_value(&envelope.metadata).unwrap_or_default(),
                self.config.default_score,
                self.config.min_score,
                self.config.max_score,
            )
            .await;

        let result = match result {
            Ok(result) => {
                Metrics::global()
                    .reputation_events_total
                    .with_label_values(&["applied"])
                    .inc();
                result
            }
            Err(error) => {
                let label = match &error {
                    crate::Error::Reputation(ReputationError::DuplicateEvent { .. }) => "duplicate",
                    _ => "failed",
                };
                Metrics::global()
                    .reputation_events_total
                    .with_label_values(&[label])
                    .inc();
                return Err(error);
            }
        };

        self.enforce_policy(envelope, community_id, &result, event_name)
            .await;

        Ok(RecordOutcome {
            new_score: result.new_score,
            tier: Tier::for_score(result.new_score),
            delta_applied: delta,
        })
    }

    /// Current score and tier; default 600/Fair when no row exists.
    pub async fn get_score(&self, community_id: i64, user_id: &str) -> Result<(f64, Tier)> {
        match self.store.load(community_id, user_id).await? {
            Some(row) => Ok((row.score, Tier::for_score(row.score))),
            None => Ok((
                self.config.default_score,
                Tier::for_score(self.config.default_score),
            )),
        }
    }

    /// Auto-ban below the threshold (once); escalate repeat moderation
    /// offenders through the timeout ladder. Failures here enqueue for retry
    /// and surface in metrics: the score write already committed.
    async fn enforce_policy(
        &self,
        envelope: &EventEnvelope,
        community_id: i64,
        result: &crate::reputation::store::ApplyResult,
        event_name: &str,
    ) {
        let metrics = Metrics::global();

        if result.new_score < self.config.auto_ban_threshold && !result.was_banned {
            let request = ModerationRequest {
                platform: envelope.platform,
                entity_id: envelope.entity_id.to_string(),
                community_id,
                user_id: envelope.user_id.clone(),
                action: ModerationAction::Ban,
                reason: format!(
                    "reputation {} below auto-ban threshold {}",
                    result.new_score, self.config.auto_ban_threshold
                ),
            };
            metrics
                .reputation_policy_actions_total
                .with_label_values(&["auto_ban"])
                .inc();
            audit::AuditRecord::new(audit::AuditType::Audit, "reputation_auto_ban")
                .actor("reputation")
                .subject(&envelope.user_id)
                .correlation(&envelope.event_id)
                .emit();

            if self.deliver(request).await
                && let Err(error) = self
                    .store
                    .set_banned(community_id, &envelope.user_id, true)
                    .await
            {
                tracing::error!(%error, user_id = %envelope.user_id, "failed to persist ban flag");
            }
            return;
        }

        if envelope.event_type.is_moderation() && event_name != "ban" {
            let window_start = chrono::Utc::now()
                - chrono::Duration::days(self.config.warning_decay_days as i64);
            let offenses = match self
                .store
                .moderation_count_since(community_id, &envelope.user_id, window_start)
                .await
            {
                Ok(n) => n,
                Err(error) => {
                    tracing::warn!(%error, "escalation lookup failed");
                    return;
                }
            };

            // The event just recorded counts as the first offense.
            let step = (offenses.max(1) as usize - 1).min(self.config.escalation_minutes.len() - 1);
            let minutes = self.config.escalation_minutes[step];

            let request = ModerationRequest {
                platform: envelope.platform,
                entity_id: envelope.entity_id.to_string(),
                community_id,
                user_id: envelope.user_id.clone(),
                action: ModerationAction::Timeout(minutes),
                reason: format!("escalation step {} for repeated moderation events", step + 1),
            };
            metrics
                .reputation_policy_actions_total
                .with_label_values(&["escalation"])
                .inc();
            self.deliver(request).await;
        }
    }

    /// Send a moderation request; on failure push it to the retry queue.
    /// Returns whether delivery succeeded.
    async fn deliver(&self, request: ModerationRequest) -> bool {
        match self.sink.request_moderation(request.clone()).await {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(%error, user_id = %request.user_id, "moderation request failed");
                self.enqueue_retry(&request).await;
                false
            }
        }
    }

    async fn enqueue_retry(&self, request: &ModerationRequest) {
        let Some(pool) = &self.retry_queue else {
            return;
        };
        let Ok(payload) = serde_json::to_string(request) else {
            return;
        };
        match pool.get().await {
            Ok(mut conn) => {
                let pushed: std::result::Result<i64, _> = deadpool_redis::redis::cmd("RPUSH")
                    .arg("reputation:policy:retry")
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;
                if let Err(error) = pushed {
                    tracing::error!(%error, "failed to enqueue moderation retry");
                }
            }
            Err(error) => {
                tracing::error!(%error, "failed to enqueue moderation retry");
            }
        }
    }

    /// Drain the policy retry queue once; called periodically by the
    /// composition root.
    pub async fn retry_failed_policies(&self) {
        let Some(pool) = &self.retry_queue else {
            return;
        };
        let Ok(mut conn) = pool.get().await else {
            return;
        };

        for _ in 0..100 {
            let popped: std::result::Result<Option<String>, _> =
                deadpool_redis::redis::cmd("LPOP")
                    .arg("reputation:policy:retry")
                    .query_async(&mut conn)
                    .await;
            let Ok(Some(payload)) = popped else {
                break;
            };
            let Ok(request) = serde_json::from_str::<ModerationRequest>(&payload) else {
                continue;
            };
            if self.sink.request_moderation(request.clone()).await.is_err() {
                // Still failing; put it back and stop for this round.
                let _: std::result::Result<i64, _> = deadpool_redis::redis::cmd("RPUSH")
                    .arg("reputation:policy:retry")
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await;
                break;
            }
        }
    }
}

fn community_of(envelope: &EventEnvelope) -> Result<i64> {
    envelope
        .metadata
        .get("community_id")
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .ok_or_else(|| {
            ReputationError::Other(anyhow::anyhow!(
                "envelope {} carries no community_id",
                envelope.event_id
            ))
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReputationConfig;
    use crate::db::test_db;
    use crate::{EventType, Platform};
    use std::sync::Mutex;

    struct RecordingSink {
        requests: Mutex<Vec<ModerationRequest>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ModerationSink for RecordingSink {
        async fn request_moderation(&self, request: ModerationRequest) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(anyhow::anyhow!("pusher down").into());
            }
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn chat_event(community: i64, user: &str) -> EventEnvelope {
        EventEnvelope::new(EventType::ChatMessage, Platform::Twitch, "foo", "1", user)
            .with_message("hi")
            .with_meta("community_id", community)
    }

    async fn engine(sink: Arc<RecordingSink>) -> ReputationEngine {
        ReputationEngine::new(test_db().await, ReputationConfig::default(), sink, None)
    }

    #[tokio::test]
    async fn chat_message_applies_default_weight() {
        let sink = RecordingSink::new();
        let engine = engine(sink).await;

        let outcome = engine.record_event(&chat_event(1, "u1")).await.unwrap();
        assert_eq!(outcome.new_score, 600.01);
        assert_eq!(outcome.delta_applied, 0.01);
        assert_eq!(outcome.tier, Tier::Fair);
    }

    #[tokio::test]
    async fn replay_is_a_duplicate() {
        let sink = RecordingSink::new();
        let engine = engine(sink).await;

        let event = chat_event(1, "u1");
        engine.record_event(&event).await.unwrap();
        let error = engine.record_event(&event).await.unwrap_err();
        assert!(matches!(
            error,
            crate::Error::Reputation(ReputationError::DuplicateEvent { .. })
        ));
    }

    #[tokio::test]
    async fn get_score_defaults_to_fair() {
        let sink = RecordingSink::new();
        let engine = engine(sink).await;

        let (score, tier) = engine.get_score(9, "nobody").await.unwrap();
        assert_eq!(score, 600.0);
        assert_eq!(tier, Tier::Fair);
    }

    #[tokio::test]
    async fn crossing_the_threshold_emits_one_ban() {
        let sink = RecordingSink::new();
        let engine = engine(sink.clone()).await;

        // Start at 600; two kicks (-75 each) end at 450, a third goes below.
        for i in 0..3 {
            let mut event = EventEnvelope::new(
                EventType::Kick,
                Platform::Twitch,
                "foo",
                "1",
                "u1",
            )
            .with_meta("community_id", 1i64);
            event.event_id = format!("kick-{i}");
            engine.record_event(&event).await.unwrap();
        }

        let requests = sink.requests.lock().unwrap();
        let bans: Vec<_> = requests
            .iter()
            .filter(|r| r.action == ModerationAction::Ban)
            .collect();
        assert_eq!(bans.len(), 1, "auto-ban fires exactly once");
        assert_eq!(bans[0].user_id, "u1");
    }

    #[tokio::test]
    async fn community_override_drives_auto_ban_scenario() {
        // Scenario: score 500, override timeout=-60, one timeout event
        // lands at 440 and triggers the moderation request.
        let db = test_db().await;
        sqlx::query("INSERT INTO weights (community_id, event_name, weight) VALUES ($1, $2, $3)")
            .bind(1i64)
            .bind("timeout")
            .bind(-60.0f64)
            .execute(db.write())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO reputation (community_id, user_id, score, total_events, banned, last_activity) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(1i64)
        .bind("u1")
        .bind(500.0f64)
        .bind(10i64)
        .bind(0i64)
        .bind(crate::db::format_ts(chrono::Utc::now()))
        .execute(db.write())
        .await
        .unwrap();

        let sink = RecordingSink::new();
        let engine = ReputationEngine::new(db, ReputationConfig::default(), sink.clone(), None);

        let event = EventEnvelope::new(EventType::Timeout, Platform::Twitch, "foo", "1", "u1")
            .with_meta("community_id", 1i64);
        let outcome = engine.record_event(&event).await.unwrap();

        assert_eq!(outcome.new_score, 440.0);
        let requests = sink.requests.lock().unwrap();
        assert!(
            requests
                .iter()
                .any(|r| r.action == ModerationAction::Ban && r.user_id == "u1"),
            "engine emits a moderation request referencing u1"
        );
    }

    #[tokio::test]
    async fn escalation_ladder_steps_up() {
        let sink = RecordingSink::new();
        let engine = engine(sink.clone()).await;

        for i in 0..3 {
            let mut event = EventEnvelope::new(
                EventType::Warn,
                Platform::Discord,
                "guild",
                "chan",
                "u2",
            )
            .with_meta("community_id", 2i64);
            event.event_id = format!("warn-{i}");
            engine.record_event(&event).await.unwrap();
        }

        let requests = sink.requests.lock().unwrap();
        let timeouts: Vec<u32> = requests
            .iter()
            .filter_map(|r| match r.action {
                ModerationAction::Timeout(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, vec![5, 60, 1_440]);
    }
}
