//! Reputation RPC surface.
//!
//! `RecordEvent` and `GetScore`, authenticated by a short-expiry HS256 token
//! carried in the request body. Failures are reported inside the response
//! envelope (`success=false` + `error`) so callers get one uniform shape.

use crate::auth::ServiceAuth;
use crate::error::ReputationError;
use crate::reputation::engine::ReputationEngine;
use crate::{EntityId, EventEnvelope, EventType, Platform, audit};

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReputationServiceState {
    pub engine: Arc<ReputationEngine>,
    pub auth: ServiceAuth,
}

#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    pub token: String,
    pub community_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    pub platform: String,
    pub platform_user_id: String,
    pub event_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Source event id; the idempotency key for the append-only log.
    pub event_id: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct GetScoreRequest {
    pub token: String,
    pub community_id: i64,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct GetScoreResponse {
    pub success: bool,
    pub score: f64,
    pub label: String,
    pub error: String,
}

pub async fn record_event(
    State(state): State<ReputationServiceState>,
    Json(request): Json<RecordEventRequest>,
) -> Json<SuccessResponse> {
    if let Err(error) = state.auth.verify_token(&request.token) {
        audit::auth_failure("reputation", "record_event", &request.event_id);
        return Json(SuccessResponse {
            success: false,
            message: String::new(),
            error: format!("Authentication failed: {error}"),
        });
    }

    let envelope = envelope_from_request(&request);
    match state.engine.record_event(&envelope).await {
        Ok(outcome) => Json(SuccessResponse {
            success: true,
            message: format!(
                "Event processed: score {} ({})",
                outcome.new_score,
                outcome.tier.label()
            ),
            error: String::new(),
        }),
        Err(crate::Error::Reputation(ReputationError::DuplicateEvent { event_id, .. })) => {
            Json(SuccessResponse {
                success: true,
                message: format!("Event skipped: {event_id} already processed"),
                error: String::new(),
            })
        }
        Err(error) => Json(SuccessResponse {
            success: false,
            message: String::new(),
            error: format!("Failed to process event: {error}"),
        }),
    }
}

pub async fn get_score(
    State(state): State<ReputationServiceState>,
    Json(request): Json<GetScoreRequest>,
) -> Json<GetScoreResponse> {
    if let Err(error) = state.auth.verify_token(&request.token) {
        audit::auth_failure("reputation", "get_score", &request.user_id);
        return Json(GetScoreResponse {
            success: false,
            score: 0.0,
            label: String::new(),
            error: format!("Authentication failed: {error}"),
        });
    }

    match state
        .engine
        .get_score(request.community_id, &request.user_id)
        .await
    {
        Ok((score, tier)) => Json(GetScoreResponse {
            success: true,
            score,
            label: tier.label().to_string(),
            error: String::new(),
        }),
        Err(error) => Json(GetScoreResponse {
            success: false,
            score: 0.0,
            label: String::new(),
            error: format!("Internal error: {error}"),
        }),
    }
}

/// Rebuild a canonical envelope from the RPC fields. The caller names users
/// in the platform namespace; `user_id` overrides when supplied.
fn envelope_from_request(request: &RecordEventRequest) -> EventEnvelope {
    let platform = Platform::parse(&request.platform);
    let event_type: EventType = serde_json::from_value(serde_json::Value::String(
        request.event_type.clone(),
    ))
    .unwrap_or(EventType::Unknown);

    let user_id = request
        .user_id
        .clone()
        .unwrap_or_else(|| request.platform_user_id.clone());

    let entity_id = request
        .metadata
        .get("entity_id")
        .and_then(|v| v.as_str())
        .map(|s| EntityId(s.to_string()))
        .unwrap_or_else(|| EntityId::new(platform, "-", "-"));

    let mut metadata = request.metadata.clone();
    metadata.insert("community_id".into(), request.community_id.into());
    metadata.insert(
        "platform_user_id".into(),
        request.platform_user_id.clone().into(),
    );

    EventEnvelope {
        event_id: request.event_id.clone(),
        event_type,
        platform,
        entity_id,
        server_id: None,
        channel_id: None,
        user_id,
        username: String::new(),
        display_name: String::new(),
        message: String::new(),
        timestamp: chrono::Utc::now(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_rebuild_prefers_explicit_user_id() {
        let request = RecordEventRequest {
            token: String::new(),
            community_id: 3,
            user_id: Some("canonical-7".into()),
            platform: "twitch".into(),
            platform_user_id: "12345".into(),
            event_type: "follow".into(),
            metadata: HashMap::new(),
            event_id: "evt-1".into(),
        };
        let envelope = envelope_from_request(&request);
        assert_eq!(envelope.user_id, "canonical-7");
        assert_eq!(envelope.event_type, EventType::Follow);
        assert_eq!(envelope.platform, Platform::Twitch);
        assert_eq!(envelope.metadata["community_id"], 3);
    }

    #[test]
    fn unknown_event_types_do_not_fail_the_call() {
        let request = RecordEventRequest {
            token: String::new(),
            community_id: 3,
            user_id: None,
            platform: "kick".into(),
            platform_user_id: "99".into(),
            event_type: "somethingNew".into(),
            metadata: HashMap::new(),
            event_id: "evt-2".into(),
        };
        let envelope = envelope_from_request(&request);
        assert_eq!(envelope.event_type, EventType::Unknown);
        assert_eq!(envelope.user_id, "99");
    }
}
