//! One generic TTL cache surface.
//!
//! Each in-memory cache in the system has an explicit TTL and a bounded
//! size; the constructors here are the only way modules build one.

use moka::future::Cache;
use std::hash::Hash;
use std::time::Duration;

/// Build a bounded TTL cache.
pub fn ttl_cache<K, V>(capacity: u64, ttl: Duration) -> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(capacity)
        .time_to_live(ttl)
        .build()
}

/// Cache of entity -> community resolutions (router hot path).
pub fn entity_cache(ttl_secs: u64) -> Cache<String, Option<i64>> {
    ttl_cache(100_000, Duration::from_secs(ttl_secs))
}

/// Cache of command-table lookups keyed by `(prefix, command)`.
pub fn command_cache<V>(ttl_secs: u64) -> Cache<(String, String), V>
where
    V: Clone + Send + Sync + 'static,
{
    ttl_cache(10_000, Duration::from_secs(ttl_secs))
}

/// Cache of `(community, event_name)` weight resolutions.
pub fn weight_cache(ttl_secs: u64) -> Cache<(i64, String), f64> {
    ttl_cache(50_000, Duration::from_secs(ttl_secs))
}

/// Emote catalogs: global (long TTL) or per-channel (short TTL).
pub fn emote_cache(ttl_secs: u64) -> Cache<String, std::sync::Arc<Vec<String>>> {
    ttl_cache(10_000, Duration::from_secs(ttl_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_cache_stores_and_expires_by_capacity_contract() {
        let cache: Cache<String, i64> = ttl_cache(16, Duration::from_secs(60));
        cache.insert("a".into(), 1).await;
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("b").await, None);
    }
}
