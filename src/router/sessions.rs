//! Session management.
//!
//! A session correlates one `(entity_id, user_id)` pair's command/response
//! exchanges inside a conversation window. Sessions live in Redis with a TTL
//! refreshed on every event; an in-memory window stands in when Redis is
//! not configured (tests, single-process dev).

use crate::{EntityId, SessionId};

use deadpool_redis::Pool;
use rand::Rng as _;
use std::time::Duration;

pub struct SessionManager {
    pool: Option<Pool>,
    ttl_secs: u64,
    fallback: moka::sync::Cache<String, SessionId>,
}

impl SessionManager {
    pub fn new(pool: Option<Pool>, ttl_secs: u64) -> Self {
        Self {
            pool,
            ttl_secs,
            fallback: moka::sync::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(ttl_secs))
                .build(),
        }
    }

    /// Return the live session for `(entity, user)`, minting one when absent
    /// or expired. The TTL refreshes on every call.
    pub async fn resolve(&self, entity_id: &EntityId, user_id: &str) -> SessionId {
        let key = format!("session:{entity_id}:{user_id}");

        if let Some(pool) = &self.pool {
            match self.redis_resolve(pool, &key).await {
                Ok(session_id) => return session_id,
                Err(error) => {
                    tracing::warn!(%error, "session store unavailable, using in-memory window");
                }
            }
        }

        if let Some(session_id) = self.fallback.get(&key) {
            // Re-insert to refresh the TTL.
            self.fallback.insert(key, session_id.clone());
            return session_id;
        }
        let session_id = mint_session_id();
        self.fallback.insert(key, session_id.clone());
        session_id
    }

    async fn redis_resolve(
        &self,
        pool: &Pool,
        key: &str,
    ) -> std::result::Result<SessionId, anyhow::Error> {
        let mut conn = pool.get().await?;

        let existing: Option<String> = deadpool_redis::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        if let Some(session_id) = existing {
            let _: bool = deadpool_redis::redis::cmd("EXPIRE")
                .arg(key)
                .arg(self.ttl_secs)
                .query_async(&mut conn)
                .await?;
            return Ok(session_id);
        }

        let session_id = mint_session_id();
        let _: String = deadpool_redis::redis::cmd("SET")
            .arg(key)
            .arg(&session_id)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(session_id)
    }

    /// Drop a session (moderator tooling, tests).
    pub async fn invalidate(&self, entity_id: &EntityId, user_id: &str) {
        let key = format!("session:{entity_id}:{user_id}");
        self.fallback.invalidate(&key);
        if let Some(pool) = &self.pool
            && let Ok(mut conn) = pool.get().await
        {
            let _: std::result::Result<i64, _> = deadpool_redis::redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await;
        }
    }
}

fn mint_session_id() -> SessionId {
    let bytes: [u8; 16] = rand::rng().random();
    format!("sess_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;

    #[tokio::test]
    async fn same_pair_keeps_its_session() {
        let manager = SessionManager::new(None, 3_600);
        let entity = EntityId::new(Platform::Twitch, "foo", "1");

        let a = manager.resolve(&entity, "u1").await;
        let b = manager.resolve(&entity, "u1").await;
        assert_eq!(a, b);
        assert!(a.starts_with("sess_"));
        assert_eq!(a.len(), "sess_".len() + 32);
    }

    #[tokio::test]
    async fn pairs_get_distinct_sessions() {
        let manager = SessionManager::new(None, 3_600);
        let entity = EntityId::new(Platform::Twitch, "foo", "1");
        let other = EntityId::new(Platform::Twitch, "foo", "2");

        let a = manager.resolve(&entity, "u1").await;
        let b = manager.resolve(&entity, "u2").await;
        let c = manager.resolve(&other, "u1").await;
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn invalidation_mints_fresh() {
        let manager = SessionManager::new(None, 3_600);
        let entity = EntityId::new(Platform::Discord, "g", "c");

        let a = manager.resolve(&entity, "u1").await;
        manager.invalidate(&entity, "u1").await;
        let b = manager.resolve(&entity, "u1").await;
        assert_ne!(a, b);
    }
}
