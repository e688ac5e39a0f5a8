//! Liveness, readiness, and metrics endpoints.

use super::state::ApiState;
use crate::telemetry::Metrics;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

/// `GET /healthz`: process liveness only.
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "module": state.config.module_name,
        "version": state.config.module_version,
    }))
}

/// `GET /ready`: 200 only when the database and Redis are reachable.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    let mut failures: Vec<String> = Vec::new();

    if let Err(error) = state.db.health_check().await {
        failures.push(format!("database: {error}"));
    }
    if let Some(streams) = &state.streams
        && let Err(error) = streams.health_check().await
    {
        failures.push(format!("redis: {error}"));
    }

    if failures.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false, "failures": failures})),
        )
            .into_response()
    }
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        Metrics::global().encode(),
    )
}
