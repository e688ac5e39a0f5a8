//! Configuration loading and validation.
//!
//! Everything comes from environment variables so the same binary can run as
//! an all-in-one process or as a single component per container.

use crate::error::{ConfigError, Result};

/// WaddleBot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Module identity reported by health endpoints and audit records.
    pub module_name: String,
    pub module_version: String,

    /// HTTP listen port.
    pub port: u16,

    /// Log level filter (`LOG_LEVEL`, defaults to `info`).
    pub log_level: String,

    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub security: SecurityConfig,
    pub stream: StreamConfig,
    pub router: RouterConfig,
    pub reputation: ReputationConfig,
    pub translation: TranslationConfig,
    pub platforms: PlatformConfig,

    /// Community-hub activity endpoint (fire-and-forget audit), optional.
    pub hub_activity_url: Option<String>,

    /// Grace period for in-flight work during shutdown.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub read_replica_url: Option<String>,
    pub pool_size: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// HS256 secret for service tokens.
    pub secret_key: String,
    /// Static shared key accepted in `X-Service-Key`.
    pub service_api_key: String,
    /// Lifetime of issued service tokens.
    pub token_ttl_secs: u64,
}

/// Stream pipeline tuning (`STREAM_*` variables).
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub block_ms: u64,
    pub max_retries: u32,
    pub consumer_count: usize,
    /// Idle time before a pending entry is reclaimed from a dead worker.
    pub claim_idle_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            block_ms: 1_000,
            max_retries: 3,
            consumer_count: 2,
            claim_idle_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Concurrency cap for one router worker.
    pub max_concurrent: usize,
    /// Recognized command prefixes.
    pub prefixes: Vec<char>,
    /// Default per-(user, command) fixed-window limit.
    pub rate_limit_per_minute: u32,
    /// Session TTL, refreshed on each event.
    pub session_ttl_secs: u64,
    /// entity -> community cache TTL.
    pub entity_cache_ttl_secs: u64,
    /// Command table cache TTL.
    pub command_cache_ttl_secs: u64,
    /// Default dispatch deadline when the command record carries none.
    pub default_timeout_ms: u64,
    /// Routing-table / channel-discovery refresh interval.
    pub discovery_refresh_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            prefixes: vec!['!', '#'],
            rate_limit_per_minute: 60,
            session_ttl_secs: 3_600,
            entity_cache_ttl_secs: 600,
            command_cache_ttl_secs: 60,
            default_timeout_ms: 30_000,
            discovery_refresh_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub default_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub auto_ban_threshold: f64,
    /// Timeout escalation ladder, minutes.
    pub escalation_minutes: Vec<u32>,
    /// Days before a warning stops counting toward escalation.
    pub warning_decay_days: u32,
    /// Weight cache TTL.
    pub weight_cache_ttl_secs: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            default_score: 600.0,
            min_score: 300.0,
            max_score: 850.0,
            auto_ban_threshold: 450.0,
            escalation_minutes: vec![5, 60, 1_440],
            warning_decay_days: 30,
            weight_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub enabled: bool,
    /// High-confidence tier: accept without verification.
    pub accept_threshold: f64,
    /// Below this the detection outcome is a rejection.
    pub reject_threshold: f64,
    /// OpenAI-compatible chat endpoint used for AI verification.
    pub ai_endpoint: Option<String>,
    pub ai_model: String,
    pub ai_timeout_ms: u64,
    pub ai_max_calls_per_message: u32,
    /// Translation provider endpoint (LibreTranslate-compatible).
    pub provider_url: Option<String>,
    /// Language messages are translated into.
    pub target_language: String,
    pub emote_global_ttl_secs: u64,
    pub emote_channel_ttl_secs: u64,
    pub emote_fetch_timeout_ms: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            accept_threshold: 0.90,
            reject_threshold: 0.70,
            ai_endpoint: None,
            ai_model: "tinyllama".into(),
            ai_timeout_ms: 2_000,
            ai_max_calls_per_message: 3,
            provider_url: None,
            target_language: "en".into(),
            emote_global_ttl_secs: 30 * 24 * 3_600,
            emote_channel_ttl_secs: 24 * 3_600,
            emote_fetch_timeout_ms: 5_000,
        }
    }
}

/// Per-platform integration credentials. A receiver only starts when its
/// required credentials are present.
#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    pub twitch: Option<TwitchConfig>,
    pub discord: Option<DiscordConfig>,
    pub slack: Option<SlackConfig>,
    pub youtube: Option<YoutubeConfig>,
    pub kick: Option<KickConfig>,
}

#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub bot_username: String,
    /// Numeric Helix user id of the bot account.
    pub bot_user_id: String,
    pub oauth_token: String,
    pub eventsub_secret: String,
    /// Refresh tokens expiring within this window.
    pub token_refresh_buffer_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub signing_secret: String,
    pub bot_token: String,
}

#[derive(Debug, Clone)]
pub struct YoutubeConfig {
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct KickConfig {
    pub webhook_secret: String,
    pub pusher_key: String,
    pub pusher_cluster: String,
    /// App access token for the public REST API (outbound actions).
    pub access_token: Option<String>,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let database = DatabaseConfig {
            url: require("DATABASE_URL")?,
            read_replica_url: optional("READ_REPLICA_URL"),
            pool_size: parse_or("DATABASE_POOL_SIZE", 10)?,
        };

        let redis = RedisConfig {
            url: optional("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
        };

        let security = SecurityConfig {
            secret_key: require("SECRET_KEY")?,
            service_api_key: require("SERVICE_API_KEY")?,
            token_ttl_secs: parse_or("SERVICE_TOKEN_TTL", 300)?,
        };

        let defaults = StreamConfig::default();
        let stream = StreamConfig {
            enabled: parse_or("STREAM_PIPELINE_ENABLED", defaults.enabled)?,
            batch_size: parse_or("STREAM_BATCH_SIZE", defaults.batch_size)?,
            block_ms: parse_or("STREAM_BLOCK_TIME", defaults.block_ms)?,
            max_retries: parse_or("STREAM_MAX_RETRIES", defaults.max_retries)?,
            consumer_count: parse_or("STREAM_CONSUMER_COUNT", defaults.consumer_count)?,
            claim_idle_ms: parse_or("STREAM_CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
        };
        if stream.batch_size == 0 {
            return Err(ConfigError::Invalid("STREAM_BATCH_SIZE must be > 0".into()).into());
        }

        let router_defaults = RouterConfig::default();
        let router = RouterConfig {
            max_concurrent: parse_or("ROUTER_MAX_CONCURRENT", router_defaults.max_concurrent)?,
            rate_limit_per_minute: parse_or(
                "ROUTER_RATE_LIMIT_PER_MINUTE",
                router_defaults.rate_limit_per_minute,
            )?,
            session_ttl_secs: parse_or("SESSION_TTL", router_defaults.session_ttl_secs)?,
            ..router_defaults
        };

        let reputation_defaults = ReputationConfig::default();
        let reputation = ReputationConfig {
            auto_ban_threshold: parse_or(
                "REPUTATION_AUTO_BAN_THRESHOLD",
                reputation_defaults.auto_ban_threshold,
            )?,
            warning_decay_days: parse_or(
                "REPUTATION_WARNING_DECAY_DAYS",
                reputation_defaults.warning_decay_days,
            )?,
            ..reputation_defaults
        };

        let translation_defaults = TranslationConfig::default();
        let translation = TranslationConfig {
            enabled: parse_or("TRANSLATION_ENABLED", translation_defaults.enabled)?,
            ai_endpoint: optional("TRANSLATION_AI_ENDPOINT"),
            ai_model: optional("TRANSLATION_AI_MODEL")
                .unwrap_or(translation_defaults.ai_model.clone()),
            provider_url: optional("TRANSLATION_PROVIDER_URL"),
            ..translation_defaults
        };

        let platforms = PlatformConfig {
            twitch: load_twitch()?,
            discord: optional("DISCORD_BOT_TOKEN").map(|bot_token| DiscordConfig { bot_token }),
            slack: load_slack(),
            youtube: optional("YOUTUBE_API_KEY").map(|api_key| YoutubeConfig { api_key }),
            kick: load_kick(),
        };

        Ok(Self {
            module_name: optional("MODULE_NAME").unwrap_or_else(|| "waddlebot".into()),
            module_version: env!("CARGO_PKG_VERSION").to_string(),
            port: parse_or("MODULE_PORT", 8000)?,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            database,
            redis,
            security,
            stream,
            router,
            reputation,
            translation,
            platforms,
            hub_activity_url: optional("HUB_ACTIVITY_URL"),
            shutdown_grace_secs: parse_or("SHUTDOWN_GRACE_SECS", 30)?,
        })
    }
}

fn load_twitch() -> Result<Option<TwitchConfig>> {
    let Some(client_id) = optional("TWITCH_CLIENT_ID") else {
        return Ok(None);
    };
    Ok(Some(TwitchConfig {
        client_id,
        client_secret: require("TWITCH_CLIENT_SECRET")?,
        bot_username: require("TWITCH_BOT_USERNAME")?,
        bot_user_id: optional("TWITCH_BOT_USER_ID").unwrap_or_default(),
        oauth_token: require("TWITCH_OAUTH_TOKEN")?,
        eventsub_secret: require("TWITCH_EVENTSUB_SECRET")?,
        token_refresh_buffer_secs: parse_or("TWITCH_TOKEN_REFRESH_BUFFER", 300)?,
    }))
}

fn load_slack() -> Option<SlackConfig> {
    Some(SlackConfig {
        signing_secret: optional("SLACK_SIGNING_SECRET")?,
        bot_token: optional("SLACK_BOT_TOKEN")?,
    })
}

fn load_kick() -> Option<KickConfig> {
    Some(KickConfig {
        webhook_secret: optional("KICK_WEBHOOK_SECRET")?,
        // Kick's public Pusher app credentials; overridable for testing.
        pusher_key: optional("KICK_PUSHER_KEY")
            .unwrap_or_else(|| "eb1d5f283081a78b932c".into()),
        pusher_cluster: optional("KICK_PUSHER_CLUSTER").unwrap_or_else(|| "us2".into()),
        access_token: optional("KICK_ACCESS_TOKEN"),
    })
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require(key: &str) -> Result<String> {
    optional(key).ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{key}={raw}: {e}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_defaults_match_contract() {
        let stream = StreamConfig::default();
        assert_eq!(stream.batch_size, 10);
        assert_eq!(stream.block_ms, 1_000);
        assert_eq!(stream.max_retries, 3);
    }

    #[test]
    fn reputation_defaults_match_contract() {
        let reputation = ReputationConfig::default();
        assert_eq!(reputation.default_score, 600.0);
        assert_eq!(reputation.auto_ban_threshold, 450.0);
        assert_eq!(reputation.escalation_minutes, vec![5, 60, 1_440]);
    }

    #[test]
    fn parse_or_rejects_garbage() {
        // SAFETY: test-local env mutation, no concurrent readers of this key.
        unsafe { std::env::set_var("WADDLE_TEST_PARSE", "not-a-number") };
        let result: Result<u32> = parse_or("WADDLE_TEST_PARSE", 5);
        assert!(result.is_err());
        unsafe { std::env::remove_var("WADDLE_TEST_PARSE") };
    }
}
