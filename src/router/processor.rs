//! The router's event-processing pipeline.
//!
//! One inbound envelope becomes zero or more downstream calls:
//! validate -> session -> community -> command detection -> rate limit ->
//! reserved check -> authorization -> dispatch -> correlation ->
//! reputation side-effect -> activity audit.

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::pipeline::{RedisStreams, StreamHandler, streams};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::reputation::ReputationEngine;
use crate::router::commands::{CommandStore, ParsedCommand, parse_command};
use crate::router::correlation::{CorrelationMap, ExecutionState, PendingExecution, finish};
use crate::router::dispatch::{DispatchOutcome, DispatchPayload, Dispatcher};
use crate::router::reserved;
use crate::router::routing::RoutingTable;
use crate::router::sessions::SessionManager;
use crate::telemetry::Metrics;
use crate::translation::{PreprocessOutcome, TranslationPreprocessor};
use crate::{EventEnvelope, EventType, ModuleResponse, ResponseAction, SessionId};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Per-event result returned to REST callers and batch entries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessSummary {
    pub success: bool,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessSummary {
    fn ok(session_id: SessionId, state: &'static str) -> Self {
        Self {
            success: true,
            session_id,
            action: None,
            state,
            error: None,
        }
    }
}

/// Fire-and-forget activity records to the community hub.
#[derive(Clone)]
pub struct ActivityClient {
    http: reqwest::Client,
    url: String,
}

impl ActivityClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    /// Post an activity record without blocking the caller. Failures log.
    pub fn record(&self, envelope: &EventEnvelope, community_id: i64, activity: &str) {
        let body = serde_json::json!({
            "community_id": community_id,
            "user_id": envelope.user_id,
            "entity_id": envelope.entity_id,
            "activity_type": activity,
            "platform": envelope.platform,
            "timestamp": envelope.timestamp,
        });
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(error) = http.post(&url).json(&body).send().await {
                tracing::debug!(%error, "activity record dropped");
            }
        });
    }
}

/// The router core. One per process; all state is shared handles.
pub struct EventProcessor {
    config: RouterConfig,
    commands: Arc<CommandStore>,
    sessions: Arc<SessionManager>,
    routing: Arc<RoutingTable>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
    correlation: Arc<CorrelationMap>,
    streams: Option<RedisStreams>,
    reputation: Option<Arc<ReputationEngine>>,
    activity: Option<ActivityClient>,
    translation: Option<Arc<TranslationPreprocessor>>,
    semaphore: Arc<Semaphore>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        commands: Arc<CommandStore>,
        sessions: Arc<SessionManager>,
        routing: Arc<RoutingTable>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<Dispatcher>,
        correlation: Arc<CorrelationMap>,
        streams: Option<RedisStreams>,
        reputation: Option<Arc<ReputationEngine>>,
        activity: Option<ActivityClient>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            commands,
            sessions,
            routing,
            limiter,
            dispatcher,
            correlation,
            streams,
            reputation,
            activity,
            translation: None,
            semaphore,
        }
    }

    /// Attach the translation preprocessor; chat messages get language
    /// detection (and translation, when configured) before fan-out.
    pub fn with_translation(mut self, translation: Arc<TranslationPreprocessor>) -> Self {
        self.translation = Some(translation);
        self
    }

    pub fn correlation(&self) -> Arc<CorrelationMap> {
        self.correlation.clone()
    }

    /// Process one inbound event end to end.
    pub async fn process_event(&self, envelope: &EventEnvelope) -> Result<ProcessSummary> {
        let _timer = Metrics::global()
            .event_processing_duration_seconds
            .start_timer();

        // 1. Validate.
        if let Err(reason) = envelope.validate() {
            return Err(RouterError::Validation(reason).into());
        }

        // 2. Session.
        let session_id = self
            .sessions
            .resolve(&envelope.entity_id, &envelope.user_id)
            .await;

        // 3. Entity -> community.
        let Some(community_id) = self.routing.community_of(&envelope.entity_id).await? else {
            return Err(RouterError::EntityNotRouted(envelope.entity_id.to_string()).into());
        };

        // 4. Command detection.
        let summary = match parse_command(&envelope.message, &self.config.prefixes) {
            Some(parsed) => {
                self.process_command(envelope, community_id, session_id, parsed)
                    .await?
            }
            None => {
                self.process_plain_event(envelope, community_id, session_id)
                    .await?
            }
        };

        // 11. Activity audit, never blocking.
        if let Some(activity) = &self.activity {
            activity.record(envelope, community_id, envelope.event_type.as_str());
        }

        Ok(summary)
    }

    /// Steps 5-10 for a prefixed command.
    async fn process_command(
        &self,
        envelope: &EventEnvelope,
        community_id: i64,
        session_id: SessionId,
        parsed: ParsedCommand,
    ) -> Result<ProcessSummary> {
        let records = self
            .commands
            .lookup(&parsed.prefix, &parsed.command, Some(community_id))
            .await?;

        // 5. Rate limit, namespaced router:<user>:<command>.
        let limit = records
            .first()
            .map(|r| r.rate_limit_per_minute)
            .unwrap_or(self.config.rate_limit_per_minute);
        let rate_key = format!("{}:{}", envelope.user_id, parsed.command);
        if let RateDecision::Limited { retry_after_secs } =
            self.limiter.check(&rate_key, limit, 60).await
        {
            Metrics::global()
                .rate_limited_total
                .with_label_values(&["router"])
                .inc();
            self.finish_unstarted(envelope, &session_id, &parsed, ExecutionState::RateLimited);
            tracing::debug!(key = %rate_key, retry_after_secs, "rate limited");
            return Err(RouterError::RateLimited { key: rate_key }.into());
        }

        // 6. Reserved-command check.
        if reserved::is_reserved(envelope.platform, &parsed.command) {
            self.finish_unstarted(envelope, &session_id, &parsed, ExecutionState::Rejected);
            return Err(RouterError::ReservedCommand(parsed.command).into());
        }

        let Some(record) = records.into_iter().next() else {
            return Ok(ProcessSummary {
                success: false,
                session_id,
                action: None,
                state: "rejected",
                error: Some(format!(
                    "No command found: {}{}",
                    parsed.prefix, parsed.command
                )),
            });
        };

        // 7. Authorization.
        if record.auth_required && !has_elevated_role(envelope) {
            self.finish_unstarted(envelope, &session_id, &parsed, ExecutionState::Unauthorized);
            return Err(RouterError::Unauthorized {
                command: parsed.command,
            }
            .into());
        }

        // Recognized command: surface it on the commands stream for
        // stream-transport consumers.
        self.publish(streams::COMMANDS, envelope).await;

        // 8-9. Dispatch under the concurrency cap, then correlate.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("router semaphore never closed");

        let execution_id = uuid::Uuid::new_v4();
        let mut execution = PendingExecution {
            session_id: session_id.clone(),
            execution_id,
            command: parsed.command.clone(),
            entity_id: envelope.entity_id.clone(),
            platform: envelope.platform,
            user_id: envelope.user_id.clone(),
            community_id,
            state: ExecutionState::Dispatched,
            started_at: chrono::Utc::now(),
        };

        let payload = DispatchPayload {
            envelope,
            session_id: &session_id,
            execution_id,
            command: &parsed.command,
            args: &parsed.args,
            community_id,
        };

        let outcome = match self.dispatcher.dispatch(&record, &payload).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let state = match error.kind() {
                    crate::error::ErrorKind::Timeout => ExecutionState::TimedOut,
                    _ => ExecutionState::Failed,
                };
                execution.state = state;
                finish(&execution, state);
                return Err(error);
            }
        };

        let summary = match outcome {
            DispatchOutcome::Completed(response) => {
                let state = if response.success {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                };
                execution.state = state;
                finish(&execution, state);
                let action = self.apply_response(&execution, &response).await;
                ProcessSummary {
                    success: response.success,
                    session_id: session_id.clone(),
                    action,
                    state: state.as_str(),
                    error: response.error.clone(),
                }
            }
            DispatchOutcome::Accepted => {
                execution.state = ExecutionState::AwaitingResponse;
                self.correlation.track(execution.clone());
                ProcessSummary::ok(session_id.clone(), "awaiting_response")
            }
        };

        // 10. A successful command earns its usage weight.
        if summary.success {
            self.emit_reputation(envelope, community_id, Some("command_usage"))
                .await?;
        }

        Ok(summary)
    }

    /// Non-command events: event-triggered records plus the reputation
    /// side-effect for enumerated event types.
    async fn process_plain_event(
        &self,
        envelope: &EventEnvelope,
        community_id: i64,
        session_id: SessionId,
    ) -> Result<ProcessSummary> {
        let envelope = &self.preprocess_language(envelope).await;

        let triggers = self
            .commands
            .event_triggers(envelope.event_type, Some(community_id))
            .await?;

        for record in &triggers {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .expect("router semaphore never closed");

            let execution_id = uuid::Uuid::new_v4();
            let payload = DispatchPayload {
                envelope,
                session_id: &session_id,
                execution_id,
                command: &record.command,
                args: &[],
                community_id,
            };
            let execution = PendingExecution {
                session_id: session_id.clone(),
                execution_id,
                command: record.command.clone(),
                entity_id: envelope.entity_id.clone(),
                platform: envelope.platform,
                user_id: envelope.user_id.clone(),
                community_id,
                state: ExecutionState::Dispatched,
                started_at: chrono::Utc::now(),
            };

            match self.dispatcher.dispatch(record, &payload).await {
                Ok(DispatchOutcome::Completed(response)) => {
                    let state = if response.success {
                        ExecutionState::Completed
                    } else {
                        ExecutionState::Failed
                    };
                    finish(&execution, state);
                    self.apply_response(&execution, &response).await;
                }
                Ok(DispatchOutcome::Accepted) => {
                    self.correlation.track(execution);
                }
                Err(error) => {
                    // Event triggers are fan-out; one failing module must not
                    // fail the event for the others.
                    tracing::warn!(%error, command = %record.command, "event trigger failed");
                    finish(&execution, ExecutionState::Failed);
                }
            }
        }

        // 10. Reputation side-effect for enumerated event types.
        self.emit_reputation(envelope, community_id, None).await?;

        Ok(ProcessSummary::ok(session_id, "completed"))
    }

    /// Run chat messages through the translation preprocessor. The result is
    /// carried as metadata; rejection outcomes leave the envelope untouched.
    async fn preprocess_language(&self, envelope: &EventEnvelope) -> EventEnvelope {
        let Some(translation) = &self.translation else {
            return envelope.clone();
        };
        if envelope.event_type != EventType::ChatMessage || envelope.message.is_empty() {
            return envelope.clone();
        }

        let channel = envelope.channel_id.clone().unwrap_or_default();
        match translation
            .process(&envelope.message, envelope.platform, &channel)
            .await
        {
            Ok(PreprocessOutcome::Translated {
                text,
                source_language,
                confidence,
            }) => envelope
                .clone()
                .with_meta("language", source_language)
                .with_meta("language_confidence", confidence)
                .with_meta("translated_message", text),
            Ok(PreprocessOutcome::NotNeeded {
                language,
                confidence,
            }) => envelope
                .clone()
                .with_meta("language", language)
                .with_meta("language_confidence", confidence),
            Ok(PreprocessOutcome::Skipped { .. }) => envelope.clone(),
            Err(error) => {
                tracing::debug!(%error, "translation preprocessing failed");
                envelope.clone()
            }
        }
    }

    /// Handle a module callback arriving via REST or `events:responses`.
    pub async fn handle_response(&self, response: &ModuleResponse) -> Result<ProcessSummary> {
        let Some(mut execution) = self.correlation.resolve(response) else {
            return Err(RouterError::UnknownExecution {
                session_id: response.session_id.clone(),
            }
            .into());
        };

        let state = if response.success {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };
        execution.state = state;
        finish(&execution, state);

        let action = self.apply_response(&execution, response).await;
        Ok(ProcessSummary {
            success: response.success,
            session_id: response.session_id.clone(),
            action,
            state: state.as_str(),
            error: response.error.clone(),
        })
    }

    /// Schedule the visible side-effect of a response. Chat responses become
    /// send requests on `events:actions`, keyed to the originating entity.
    async fn apply_response(
        &self,
        execution: &PendingExecution,
        response: &ModuleResponse,
    ) -> Option<serde_json::Value> {
        if response.response_action != ResponseAction::Chat {
            return None;
        }
        let message = response
            .response_data
            .get("message")
            .or_else(|| response.response_data.get("content"))
            .and_then(|v| v.as_str())?
            .to_string();

        let (_, server, channel) = execution.entity_id.parts()?;
        let action = EventEnvelope::new(
            EventType::ChatMessage,
            execution.platform,
            server,
            channel,
            &execution.user_id,
        )
        .with_message(&message)
        .with_meta("action", "send_chat")
        .with_meta("session_id", execution.session_id.clone())
        .with_meta("community_id", execution.community_id);

        self.publish(streams::ACTIONS, &action).await;
        Some(serde_json::json!({"type": "chat", "message": message}))
    }

    /// Emit the reputation side-effect. Failures propagate so the stream
    /// layer can redeliver; duplicates are swallowed (at-least-once replays
    /// are expected).
    async fn emit_reputation(
        &self,
        envelope: &EventEnvelope,
        community_id: i64,
        event_name: Option<&str>,
    ) -> Result<()> {
        let Some(engine) = &self.reputation else {
            return Ok(());
        };

        let mut enriched = envelope.clone();
        enriched
            .metadata
            .insert("community_id".into(), community_id.into());

        let result = match event_name {
            Some(name) => engine.record_event_as(&enriched, name).await,
            None => engine.record_event(&enriched).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(crate::Error::Reputation(
                crate::error::ReputationError::DuplicateEvent { .. },
            )) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Terminal outcome for a command that never reached dispatch.
    fn finish_unstarted(
        &self,
        envelope: &EventEnvelope,
        session_id: &SessionId,
        parsed: &ParsedCommand,
        state: ExecutionState,
    ) {
        let execution = PendingExecution {
            session_id: session_id.clone(),
            execution_id: uuid::Uuid::nil(),
            command: parsed.command.clone(),
            entity_id: envelope.entity_id.clone(),
            platform: envelope.platform,
            user_id: envelope.user_id.clone(),
            community_id: 0,
            state,
            started_at: chrono::Utc::now(),
        };
        finish(&execution, state);
    }

    async fn publish(&self, stream: &str, envelope: &EventEnvelope) {
        let Some(streams) = &self.streams else {
            return;
        };
        let Ok(payload) = serde_json::to_string(envelope) else {
            return;
        };
        if let Err(error) = streams.publish(stream, &envelope.event_id, &payload).await {
            tracing::warn!(%error, stream, "stream publish failed");
        }
    }

    /// Batch ingest: up to 100 events, processed concurrently under the
    /// worker's semaphore, with one result per input event.
    pub async fn process_batch(
        &self,
        envelopes: Vec<EventEnvelope>,
    ) -> Vec<std::result::Result<ProcessSummary, String>> {
        let results = futures::future::join_all(
            envelopes
                .iter()
                .map(|envelope| self.process_event(envelope)),
        )
        .await;

        results
            .into_iter()
            .map(|result| result.map_err(|e| e.to_string()))
            .collect()
    }

    /// Point-in-time counters for the metrics surface.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "in_flight_responses": self.correlation.in_flight(),
            "available_concurrency": self.semaphore.available_permits(),
            "max_concurrent": self.config.max_concurrent,
        })
    }

    /// Expire executions that never received their module response.
    pub fn expire_stale_executions(&self) {
        let max_age = chrono::Duration::milliseconds(self.config.default_timeout_ms as i64 * 4);
        for execution in self.correlation.expire_stale(max_age) {
            tracing::warn!(
                session_id = %execution.session_id,
                command = %execution.command,
                "module response never arrived"
            );
        }
    }
}

/// Consume `events:responses`: module callbacks arriving asynchronously.
///
/// The payload on this stream is the callback body, not an envelope, so the
/// generic envelope consumer does not apply. Unknown executions are a
/// terminal skip (the execution already expired); malformed payloads go to
/// the DLQ.
pub async fn run_response_consumer(
    streams: RedisStreams,
    processor: Arc<EventProcessor>,
    config: crate::config::StreamConfig,
    consumer_name: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    const GROUP: &str = "router-responses";

    if let Err(error) = streams.ensure_group(streams::RESPONSES, GROUP).await {
        tracing::error!(%error, "failed to create responses consumer group");
        return;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let entries = match streams
            .read_group(
                streams::RESPONSES,
                GROUP,
                &consumer_name,
                config.batch_size,
                config.block_ms,
            )
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, "responses stream read failed");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        for entry in entries {
            match serde_json::from_str::<ModuleResponse>(&entry.payload) {
                Ok(response) => {
                    if let Err(error) = processor.handle_response(&response).await {
                        tracing::debug!(%error, session_id = %response.session_id, "response skipped");
                    }
                    if let Err(error) = streams.ack(streams::RESPONSES, GROUP, &entry.id).await {
                        tracing::warn!(%error, "responses ack failed");
                    }
                }
                Err(parse_error) => {
                    let reason = format!("malformed response payload: {parse_error}");
                    if streams
                        .publish_dead_letter(streams::RESPONSES, &entry, &reason)
                        .await
                        .is_ok()
                        && let Err(error) =
                            streams.ack(streams::RESPONSES, GROUP, &entry.id).await
                    {
                        tracing::warn!(%error, "responses ack failed after dlq");
                    }
                }
            }
        }
    }
}

/// Identity check for `auth_required` commands, resolved from the
/// platform-asserted role metadata receivers attach.
fn has_elevated_role(envelope: &EventEnvelope) -> bool {
    let truthy = |key: &str| {
        envelope
            .metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    truthy("is_mod")
        || truthy("is_moderator")
        || truthy("is_broadcaster")
        || truthy("is_channel_owner")
        || truthy("is_admin")
        || envelope
            .metadata
            .get("roles")
            .and_then(|v| v.as_array())
            .is_some_and(|roles| {
                roles.iter().any(|r| {
                    matches!(r.as_str(), Some("moderator") | Some("admin") | Some("owner"))
                })
            })
}

#[async_trait]
impl StreamHandler for EventProcessor {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        self.process_event(&envelope).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_roles_from_metadata() {
        let plain = EventEnvelope::new(
            EventType::ChatMessage,
            crate::Platform::Twitch,
            "foo",
            "1",
            "u1",
        );
        assert!(!has_elevated_role(&plain));

        let moderator = plain.clone().with_meta("is_mod", true);
        assert!(has_elevated_role(&moderator));

        let role_list = plain
            .clone()
            .with_meta("roles", serde_json::json!(["viewer", "moderator"]));
        assert!(has_elevated_role(&role_list));

        let viewer = plain.with_meta("roles", serde_json::json!(["viewer"]));
        assert!(!has_elevated_role(&viewer));
    }
}
