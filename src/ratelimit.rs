//! Distributed rate limiter.
//!
//! Fixed-window counters in Redis, namespaced per caller, with an in-memory
//! fallback window so rate limiting stays best-effort when Redis is down
//! rather than failing open or blocking the hot path.

use deadpool_redis::Pool;
use std::collections::HashMap;
use std::sync::Mutex;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Fixed-window limiter. Keys are `<namespace>:<subject>:<window>` and the
/// counter TTL equals the window length, so stale windows expire on their own.
pub struct RateLimiter {
    pool: Option<Pool>,
    namespace: String,
    fallback: Mutex<HashMap<String, (u64, u32)>>,
}

impl RateLimiter {
    pub fn new(pool: Option<Pool>, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Count one hit for `subject` and decide.
    pub async fn check(&self, subject: &str, limit: u32, window_secs: u64) -> RateDecision {
        let now = chrono::Utc::now().timestamp() as u64;
        self.check_at(subject, limit, window_secs, now).await
    }

    async fn check_at(
        &self,
        subject: &str,
        limit: u32,
        window_secs: u64,
        now: u64,
    ) -> RateDecision {
        let window = now / window_secs.max(1);
        let key = format!("{}:{}:{}", self.namespace, subject, window);

        if let Some(pool) = &self.pool {
            match self.redis_incr(pool, &key, window_secs).await {
                Ok(count) => return decide(count, limit, window_secs, now),
                Err(error) => {
                    tracing::warn!(%error, "rate limiter falling back to in-memory window");
                }
            }
        }

        let count = {
            let mut windows = self.fallback.lock().expect("rate limit window lock");
            let entry = windows.entry(format!("{}:{}", self.namespace, subject)).or_insert((window, 0));
            if entry.0 != window {
                *entry = (window, 0);
            }
            entry.1 += 1;
            // Drop stale subjects so the fallback map stays bounded.
            if windows.len() > 10_000 {
                windows.retain(|_, (w, _)| *w == window);
            }
            windows
                .get(&format!("{}:{}", self.namespace, subject))
                .map(|(_, c)| *c)
                .unwrap_or(1)
        };
        decide(count as u64, limit, window_secs, now)
    }

    async fn redis_incr(
        &self,
        pool: &Pool,
        key: &str,
        window_secs: u64,
    ) -> std::result::Result<u64, anyhow::Error> {
        let mut conn = pool.get().await?;
        let count: u64 = deadpool_redis::redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        if count == 1 {
            let _: bool = deadpool_redis::redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }
}

fn decide(count: u64, limit: u32, window_secs: u64, now: u64) -> RateDecision {
    if count <= limit as u64 {
        RateDecision::Allowed {
            remaining: limit.saturating_sub(count as u32),
        }
    } else {
        let window_end = (now / window_secs.max(1) + 1) * window_secs.max(1);
        RateDecision::Limited {
            retry_after_secs: window_end.saturating_sub(now).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_window_enforces_limit() {
        let limiter = RateLimiter::new(None, "router");
        let now = 1_700_000_000;

        for i in 0..2 {
            let decision = limiter.check_at("u1:help", 2, 60, now + i).await;
            assert!(decision.is_allowed(), "call {i} should pass");
        }
        let decision = limiter.check_at("u1:help", 2, 60, now + 2).await;
        assert!(matches!(decision, RateDecision::Limited { .. }));
    }

    #[tokio::test]
    async fn fallback_window_resets() {
        let limiter = RateLimiter::new(None, "router");
        let now = 1_700_000_000;

        for _ in 0..3 {
            limiter.check_at("u1:help", 2, 60, now).await;
        }
        assert!(
            !limiter.check_at("u1:help", 2, 60, now).await.is_allowed(),
            "limited inside the window"
        );

        let next_window = (now / 60 + 1) * 60;
        assert!(
            limiter
                .check_at("u1:help", 2, 60, next_window)
                .await
                .is_allowed(),
            "fresh window admits again"
        );
    }

    #[tokio::test]
    async fn subjects_do_not_interfere() {
        let limiter = RateLimiter::new(None, "router");
        let now = 1_700_000_000;

        for _ in 0..5 {
            limiter.check_at("u1:help", 2, 60, now).await;
        }
        assert!(limiter.check_at("u2:help", 2, 60, now).await.is_allowed());
    }

    #[test]
    fn retry_after_reaches_window_end() {
        let decision = decide(3, 2, 60, 130);
        match decision {
            RateDecision::Limited { retry_after_secs } => assert_eq!(retry_after_secs, 50),
            _ => panic!("should be limited"),
        }
    }
}
