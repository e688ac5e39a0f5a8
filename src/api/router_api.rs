//! The router REST surface under `/api/v1/router`.
//!
//! Every endpoint requires service-to-service auth: `X-Service-Key` or a
//! bearer token.

use super::error::ApiError;
use super::state::ApiState;
use crate::error::RouterError;
use crate::{EventEnvelope, ModuleResponse, audit};

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;

/// Batch calls carry at most this many envelopes.
const MAX_BATCH: usize = 100;

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let service_key = headers
        .get("x-service-key")
        .and_then(|v| v.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    state
        .auth
        .verify_either(service_key, bearer)
        .map(|_| ())
        .map_err(|error| {
            audit::auth_failure("router_api", "service_auth", "");
            ApiError(error.into())
        })
}

/// `POST /api/v1/router/events`: one envelope in, `{success, session_id,
/// action}` out.
pub async fn ingest_event(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(envelope): Json<EventEnvelope>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let summary = state.processor.process_event(&envelope).await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

/// `POST /api/v1/router/events/batch`: up to 100 envelopes, one result per
/// entry, processed concurrently.
pub async fn ingest_batch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(envelopes): Json<Vec<EventEnvelope>>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    authorize(&state, &headers)?;
    if envelopes.len() > MAX_BATCH {
        return Err(ApiError(
            RouterError::Validation(format!(
                "batch of {} exceeds the {MAX_BATCH}-event limit",
                envelopes.len()
            ))
            .into(),
        ));
    }

    let results = state.processor.process_batch(envelopes).await;
    Ok(Json(
        results
            .into_iter()
            .map(|result| match result {
                Ok(summary) => serde_json::to_value(summary).unwrap_or_default(),
                Err(error) => serde_json::json!({"success": false, "error": error}),
            })
            .collect(),
    ))
}

/// `POST /api/v1/router/responses`: module callback for async completions.
pub async fn module_response(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(response): Json<ModuleResponse>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let summary = state.processor.handle_response(&response).await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

/// `GET /api/v1/router/commands`: the active command table.
pub async fn list_commands(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let commands = state.commands.list_active().await?;
    Ok(Json(serde_json::json!({"commands": commands})))
}

/// `GET /api/v1/router/metrics`: point-in-time router counters.
pub async fn router_metrics(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.processor.snapshot()))
}
