//! Receiver webhook endpoints.
//!
//! Every signed platform verifies against the raw body bytes before any
//! side-effect; a bad signature is 401 plus one AUTH FAILURE audit record
//! and nothing reaches `events:inbound`.

use super::state::ApiState;
use crate::receivers::{kick, slack, twitch, webhook, youtube};
use crate::telemetry::Metrics;
use crate::{Platform, audit};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use std::collections::HashMap;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn reject(platform: Platform, reason: &'static str) -> StatusCode {
    Metrics::global()
        .webhook_rejections_total
        .with_label_values(&[platform.as_str(), reason])
        .inc();
    audit::auth_failure(platform.as_str(), "webhook_signature", reason);
    StatusCode::UNAUTHORIZED
}

/// `POST /webhooks/twitch/eventsub`
pub async fn twitch_eventsub(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(twitch_config) = &state.config.platforms.twitch else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let message_id = header(&headers, "twitch-eventsub-message-id");
    let timestamp = header(&headers, "twitch-eventsub-message-timestamp");
    let signature = header(&headers, "twitch-eventsub-message-signature");

    if !webhook::verify_twitch_signature(
        &twitch_config.eventsub_secret,
        message_id,
        timestamp,
        &body,
        signature,
    ) {
        return reject(Platform::Twitch, "bad_signature").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match header(&headers, "twitch-eventsub-message-type") {
        "webhook_callback_verification" => {
            let challenge = payload
                .get("challenge")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            (StatusCode::OK, challenge.to_string()).into_response()
        }
        "revocation" => {
            tracing::warn!(
                subscription = %payload.pointer("/subscription/type").and_then(|v| v.as_str()).unwrap_or("?"),
                "eventsub subscription revoked"
            );
            StatusCode::OK.into_response()
        }
        _ => {
            if let Some(envelope) = twitch::envelope_from_eventsub(&payload) {
                state.ingest(envelope).await;
            }
            StatusCode::OK.into_response()
        }
    }
}

/// `POST /webhooks/kick`
pub async fn kick_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(kick_config) = &state.config.platforms.kick else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let signature = header(&headers, "kick-event-signature");
    if !webhook::verify_signature(&kick_config.webhook_secret, &body, signature) {
        return reject(Platform::Kick, "bad_signature").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let event_type = header(&headers, "kick-event-type");
    if let Some(envelope) = kick::envelope_from_webhook(event_type, &payload) {
        state.ingest(envelope).await;
    }
    StatusCode::OK.into_response()
}

/// `POST /webhooks/slack/events`
pub async fn slack_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(slack_config) = &state.config.platforms.slack else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let timestamp = header(&headers, "x-slack-request-timestamp");
    let signature = header(&headers, "x-slack-signature");
    if !webhook::verify_slack_signature(
        &slack_config.signing_secret,
        timestamp,
        &body,
        signature,
        chrono::Utc::now().timestamp(),
    ) {
        return reject(Platform::Slack, "bad_signature").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match slack::handle_event_body(&payload) {
        slack::SlackInbound::Challenge(challenge) => {
            (StatusCode::OK, challenge).into_response()
        }
        slack::SlackInbound::Event(envelope) => {
            state.ingest(envelope).await;
            StatusCode::OK.into_response()
        }
        slack::SlackInbound::Ignored => StatusCode::OK.into_response(),
    }
}

/// `POST /webhooks/slack/interactions`: block-kit `payload=` form posts.
pub async fn slack_interactions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(slack_config) = &state.config.platforms.slack else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let timestamp = header(&headers, "x-slack-request-timestamp");
    let signature = header(&headers, "x-slack-signature");
    if !webhook::verify_slack_signature(
        &slack_config.signing_secret,
        timestamp,
        &body,
        signature,
        chrono::Utc::now().timestamp(),
    ) {
        return reject(Platform::Slack, "bad_signature").into_response();
    }

    let form = String::from_utf8_lossy(&body);
    let payload = form
        .split('&')
        .find_map(|pair| pair.strip_prefix("payload="))
        .and_then(|encoded| urldecode(encoded))
        .and_then(|decoded| serde_json::from_str::<serde_json::Value>(&decoded).ok());

    if let Some(payload) = payload
        && let Some(envelope) = slack::envelope_from_interaction(&payload)
    {
        state.ingest(envelope).await;
    }
    StatusCode::OK.into_response()
}

/// `GET /webhooks/youtube/websub`: subscription verification echo.
pub async fn youtube_websub_verify(
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let topic = params.get("hub.topic").map(String::as_str).unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");

    match webhook::websub_challenge(mode, topic, challenge) {
        Some(challenge) => (StatusCode::OK, challenge.to_string()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /webhooks/youtube/websub`: Atom notification.
pub async fn youtube_websub_notify(
    State(state): State<ApiState>,
    body: Bytes,
) -> impl IntoResponse {
    let text = String::from_utf8_lossy(&body);
    if let Some(envelope) = youtube::envelope_from_websub_notification(&text) {
        state.ingest(envelope).await;
    }
    // Non-2xx makes the hub retry and eventually drop the subscription.
    StatusCode::NO_CONTENT
}

/// Minimal percent-decoding for the Slack `payload=` field.
fn urldecode(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut chars = encoded.bytes();
    while let Some(b) = chars.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let hex = [hi, lo];
                let value = u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()?;
                bytes.push(value);
            }
            other => bytes.push(other),
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urldecode_handles_percent_and_plus() {
        assert_eq!(
            urldecode("%7B%22a%22%3A+1%7D").as_deref(),
            Some("{\"a\": 1}")
        );
        assert_eq!(urldecode("plain").as_deref(), Some("plain"));
        assert!(urldecode("%zz").is_none());
    }
}
