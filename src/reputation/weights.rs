//! Weight resolution: per-community overrides with compiled-in defaults,
//! and metadata-driven delta scaling.

use crate::db::Db;
use crate::error::Result;
use crate::{EventEnvelope, EventType};

use moka::future::Cache;

/// Default weights applied when a community has no override row.
pub const DEFAULT_WEIGHTS: &[(&str, f64)] = &[
    ("chat_message", 0.01),
    ("command_usage", -0.1),
    ("giveaway_entry", -1.0),
    ("follow", 1.0),
    ("subscription", 5.0),
    ("sub_tier2", 10.0),
    ("sub_tier3", 20.0),
    ("gift_sub", 3.0),
    ("donation_per_dollar", 1.0),
    ("cheer_per_100_bits", 1.0),
    ("raid", 2.0),
    ("boost", 5.0),
    ("warn", -25.0),
    ("timeout", -50.0),
    ("kick", -75.0),
    ("ban", -200.0),
];

/// The weight-table name an envelope resolves against.
///
/// Subscription tiers pick tier-specific defaults; everything else maps
/// one-to-one.
pub fn weight_event_name(envelope: &EventEnvelope) -> &'static str {
    match envelope.event_type {
        EventType::ChatMessage => "chat_message",
        EventType::Subscription | EventType::Resub => match envelope.sub_tier() {
            Some(2) => "sub_tier2",
            Some(3) => "sub_tier3",
            _ => "subscription",
        },
        EventType::Subgift => "gift_sub",
        EventType::Follow => "follow",
        EventType::Donation => "donation_per_dollar",
        EventType::Cheer => "cheer_per_100_bits",
        EventType::Raid | EventType::Host => "raid",
        EventType::Boost => "boost",
        EventType::Warn => "warn",
        EventType::Timeout => "timeout",
        EventType::Kick => "kick",
        EventType::Ban => "ban",
        _ => "chat_message",
    }
}

/// Scale a resolved weight by the envelope's typed metadata: donations by
/// amount, cheers by bits/100. Everything else applies the weight as-is.
pub fn scale_delta(weight: f64, envelope: &EventEnvelope) -> f64 {
    match envelope.event_type {
        EventType::Donation => weight * envelope.donation_amount().unwrap_or(0.0),
        EventType::Cheer => weight * (envelope.bits().unwrap_or(0) as f64 / 100.0),
        _ => weight,
    }
}

/// Resolves `(community, event_name)` to a signed weight, caching rows with a
/// short TTL so operator edits take effect without a restart.
pub struct WeightResolver {
    db: Db,
    cache: Cache<(i64, String), f64>,
}

impl WeightResolver {
    pub fn new(db: Db, cache_ttl_secs: u64) -> Self {
        Self {
            db,
            cache: crate::cache::weight_cache(cache_ttl_secs),
        }
    }

    /// Override row if present, compiled-in default otherwise, 0 for names
    /// nobody weighs.
    pub async fn resolve(&self, community_id: i64, event_name: &str) -> Result<f64> {
        let key = (community_id, event_name.to_string());
        if let Some(weight) = self.cache.get(&key).await {
            crate::telemetry::Metrics::global()
                .cache_hits_total
                .with_label_values(&["weights"])
                .inc();
            return Ok(weight);
        }
        crate::telemetry::Metrics::global()
            .cache_misses_total
            .with_label_values(&["weights"])
            .inc();

        let row: Option<(f64,)> = sqlx::query_as(
            "SELECT weight FROM weights WHERE community_id = $1 AND event_name = $2",
        )
        .bind(community_id)
        .bind(event_name)
        .fetch_optional(self.db.read())
        .await?;

        let weight = row
            .map(|(w,)| w)
            .or_else(|| default_weight(event_name))
            .unwrap_or(0.0);

        self.cache.insert(key, weight).await;
        Ok(weight)
    }
}

pub fn default_weight(event_name: &str) -> Option<f64> {
    DEFAULT_WEIGHTS
        .iter()
        .find(|(name, _)| *name == event_name)
        .map(|(_, w)| *w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventEnvelope, EventType, Platform};

    fn envelope(event_type: EventType) -> EventEnvelope {
        EventEnvelope::new(event_type, Platform::Twitch, "chan", "1", "u1")
    }

    #[test]
    fn default_table_is_complete() {
        assert_eq!(default_weight("chat_message"), Some(0.01));
        assert_eq!(default_weight("ban"), Some(-200.0));
        assert_eq!(default_weight("sub_tier3"), Some(20.0));
        assert_eq!(default_weight("nonexistent"), None);
    }

    #[test]
    fn sub_tiers_pick_their_weights() {
        let t1 = envelope(EventType::Subscription).with_meta("tier", "1000");
        let t2 = envelope(EventType::Subscription).with_meta("tier", "2000");
        let t3 = envelope(EventType::Resub).with_meta("tier", "3000");
        assert_eq!(weight_event_name(&t1), "subscription");
        assert_eq!(weight_event_name(&t2), "sub_tier2");
        assert_eq!(weight_event_name(&t3), "sub_tier3");
    }

    #[test]
    fn donations_scale_by_amount() {
        let donation = envelope(EventType::Donation).with_meta("amount", 12.5);
        assert_eq!(scale_delta(1.0, &donation), 12.5);

        let no_amount = envelope(EventType::Donation);
        assert_eq!(scale_delta(1.0, &no_amount), 0.0);
    }

    #[test]
    fn cheers_scale_by_bits() {
        let cheer = envelope(EventType::Cheer).with_meta("bits", 250u64);
        assert_eq!(scale_delta(1.0, &cheer), 2.5);
    }

    #[tokio::test]
    async fn resolver_prefers_override_rows() {
        let db = crate::db::test_db().await;
        sqlx::query("INSERT INTO weights (community_id, event_name, weight) VALUES ($1, $2, $3)")
            .bind(7i64)
            .bind("timeout")
            .bind(-60.0f64)
            .execute(db.write())
            .await
            .unwrap();

        let resolver = WeightResolver::new(db, 300);
        assert_eq!(resolver.resolve(7, "timeout").await.unwrap(), -60.0);
        assert_eq!(resolver.resolve(8, "timeout").await.unwrap(), -50.0);
        assert_eq!(resolver.resolve(7, "unheard_of").await.unwrap(), 0.0);
    }
}
