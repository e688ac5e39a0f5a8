//! Top-level error types for WaddleBot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Reputation(#[from] ReputationError),

    #[error(transparent)]
    Receiver(#[from] ReceiverError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify into the coarse failure kinds the stream and REST
    /// boundaries act on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Internal,
            Error::Pipeline(e) => e.kind(),
            Error::Router(e) => e.kind(),
            Error::Reputation(e) => e.kind(),
            Error::Receiver(e) => e.kind(),
            Error::Translate(_) => ErrorKind::Internal,
            Error::Auth(e) => e.kind(),
            Error::Sqlx(_) | Error::RedisPool(_) | Error::Redis(_) => {
                ErrorKind::DependencyUnavailable
            }
            Error::Io(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Coarse failure classification driving retry/DLQ/status-code decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad envelope or request: reject locally, 400 on REST, DLQ on streams.
    Validation,
    /// Bad credentials: 401, no side-effects.
    Auth,
    /// Missing scope/role: 403, no side-effects.
    Authz,
    /// Over the window limit: recorded, never retried.
    RateLimited,
    /// Command/entity/user absent: terminal skip on streams, 404 on REST.
    NotFound,
    /// DB/Redis/upstream unreachable: leave unacked for the claim timer, 503 on REST.
    DependencyUnavailable,
    /// Deadline exceeded: retry when idempotent and under max_retries.
    Timeout,
    /// Unexpected: capture context, ack and DLQ to avoid poisoning the stream.
    Internal,
}

impl ErrorKind {
    /// Whether a stream consumer should leave the entry unacked for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::DependencyUnavailable | ErrorKind::Timeout)
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stream pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to connect to redis: {0}")]
    Connection(String),

    #[error("failed to create consumer group {group} on {stream}: {reason}")]
    ConsumerGroup {
        stream: String,
        group: String,
        reason: String,
    },

    #[error("malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },

    #[error("stream publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Connection(_) | PipelineError::Publish(_) => {
                ErrorKind::DependencyUnavailable
            }
            PipelineError::ConsumerGroup { .. } => ErrorKind::DependencyUnavailable,
            PipelineError::MalformedEntry { .. } => ErrorKind::Validation,
            PipelineError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Router processing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid event: {0}")]
    Validation(String),

    #[error("rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("command not found: {prefix}{command}")]
    CommandNotFound { prefix: String, command: String },

    #[error("entity not routed: {0}")]
    EntityNotRouted(String),

    #[error("command '{0}' is reserved by the platform")]
    ReservedCommand(String),

    #[error("user lacks required role for {command}")]
    Unauthorized { command: String },

    #[error("dispatch to {target} timed out after {timeout_ms}ms")]
    DispatchTimeout { target: String, timeout_ms: u64 },

    #[error("dispatch to {target} failed: {reason}")]
    DispatchFailed { target: String, reason: String },

    #[error("no pending execution for session {session_id}")]
    UnknownExecution { session_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Validation(_) => ErrorKind::Validation,
            RouterError::RateLimited { .. } => ErrorKind::RateLimited,
            RouterError::CommandNotFound { .. }
            | RouterError::EntityNotRouted(_)
            | RouterError::UnknownExecution { .. } => ErrorKind::NotFound,
            RouterError::ReservedCommand(_) => ErrorKind::Validation,
            RouterError::Unauthorized { .. } => ErrorKind::Authz,
            RouterError::DispatchTimeout { .. } => ErrorKind::Timeout,
            RouterError::DispatchFailed { .. } => ErrorKind::DependencyUnavailable,
            RouterError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Reputation engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("duplicate event {event_id} for community {community_id}")]
    DuplicateEvent { community_id: i64, event_id: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("unknown community: {0}")]
    UnknownCommunity(i64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReputationError {
    fn kind(&self) -> ErrorKind {
        match self {
            // A replayed event is an expected at-least-once outcome, not a retry.
            ReputationError::DuplicateEvent { .. } => ErrorKind::NotFound,
            ReputationError::Storage(_) => ErrorKind::DependencyUnavailable,
            ReputationError::UnknownCommunity(_) => ErrorKind::NotFound,
            ReputationError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Trigger receiver errors.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("webhook signature invalid")]
    InvalidSignature,

    #[error("webhook payload malformed: {0}")]
    MalformedPayload(String),

    #[error("{platform} connection failed: {reason}")]
    Connection { platform: String, reason: String },

    #[error("oauth token refresh failed: {0}")]
    TokenRefresh(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReceiverError {
    fn kind(&self) -> ErrorKind {
        match self {
            ReceiverError::InvalidSignature => ErrorKind::Auth,
            ReceiverError::MalformedPayload(_) => ErrorKind::Validation,
            ReceiverError::Connection { .. } | ReceiverError::TokenRefresh(_) => {
                ErrorKind::DependencyUnavailable
            }
            ReceiverError::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Translation preprocessor errors.
///
/// "Text too short" and "confidence below threshold" are outcomes of the
/// detection pipeline, not errors; only infrastructure failures land here.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("translation provider failed: {0}")]
    Provider(String),

    #[error("emote catalog fetch failed for {platform}: {reason}")]
    EmoteCatalog { platform: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Service-to-service authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid service key")]
    InvalidServiceKey,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("missing scope: {0}")]
    MissingScope(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MissingScope(_) => ErrorKind::Authz,
            AuthError::Other(_) => ErrorKind::Internal,
            _ => ErrorKind::Auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::DependencyUnavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }

    #[test]
    fn rate_limit_classification() {
        let error: Error = RouterError::RateLimited {
            key: "router:u1:help".into(),
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn duplicate_reputation_event_is_terminal_skip() {
        let error: Error = ReputationError::DuplicateEvent {
            community_id: 1,
            event_id: "evt".into(),
        }
        .into();
        assert!(!error.kind().is_retryable());
    }
}
