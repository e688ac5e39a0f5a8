//! Slack receiver: signed Events API payload mapping.
//!
//! Slack needs no held-open socket: deliveries arrive on the webhook
//! surface, which verifies the v0 signature before anything here runs.
//! Block-kit interactions arrive as separate `payload=` form posts.

use crate::{EventEnvelope, EventType, Platform};

/// Handle the Events API body: either a `url_verification` challenge to echo
/// or an `event_callback` to normalize.
pub enum SlackInbound {
    Challenge(String),
    Event(EventEnvelope),
    Ignored,
}

pub fn handle_event_body(body: &serde_json::Value) -> SlackInbound {
    match body.get("type").and_then(|v| v.as_str()) {
        Some("url_verification") => {
            let challenge = body
                .get("challenge")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            SlackInbound::Challenge(challenge.to_string())
        }
        Some("event_callback") => match envelope_from_event(body) {
            Some(envelope) => SlackInbound::Event(envelope),
            None => SlackInbound::Ignored,
        },
        _ => SlackInbound::Ignored,
    }
}

/// Map one event_callback to the canonical envelope. Unknown inner event
/// types are preserved as `event_type=unknown` with the payload in
/// `metadata.raw` rather than dropped.
fn envelope_from_event(body: &serde_json::Value) -> Option<EventEnvelope> {
    let team = body.get("team_id").and_then(|v| v.as_str()).unwrap_or("-");
    let event = body.get("event")?;
    let inner_type = event.get("type").and_then(|v| v.as_str())?;

    let channel = event
        .get("channel")
        .or_else(|| event.get("channel_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("-");
    let user = event
        .get("user")
        .or_else(|| event.get("user_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    // The bot's own posts echo back through the Events API.
    if event.get("bot_id").is_some() {
        return None;
    }

    let (event_type, message) = match inner_type {
        "message" => (
            EventType::ChatMessage,
            event
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "app_mention" => (
            EventType::AppMention,
            event
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "member_joined_channel" => (EventType::ChannelJoin, String::new()),
        "member_left_channel" => (EventType::MemberLeave, String::new()),
        "file_shared" => (EventType::FileShare, String::new()),
        "reaction_added" => (EventType::Reaction, String::new()),
        _ => (EventType::Unknown, String::new()),
    };

    let mut envelope = EventEnvelope::new(
        event_type,
        Platform::Slack,
        team.to_string(),
        channel.to_string(),
        user,
    )
    .with_message(message)
    .with_meta("slack_event_type", inner_type);

    if event_type == EventType::Unknown {
        envelope = envelope.with_meta("raw", body.clone());
    }
    if let Some(ts) = event.get("ts").and_then(|v| v.as_str()) {
        envelope = envelope.with_meta("ts", ts);
    }
    if let Some(reaction) = event.get("reaction").and_then(|v| v.as_str()) {
        envelope = envelope.with_meta("reaction", reaction);
    }
    Some(envelope)
}

/// Map a block-kit interaction payload (`payload=` form field) to an
/// envelope. Button clicks and select submissions are their own events
/// carrying the action id and value.
pub fn envelope_from_interaction(payload: &serde_json::Value) -> Option<EventEnvelope> {
    let team = payload
        .pointer("/team/id")
        .and_then(|v| v.as_str())
        .unwrap_or("-");
    let channel = payload
        .pointer("/channel/id")
        .and_then(|v| v.as_str())
        .unwrap_or("-");
    let user = payload.pointer("/user/id").and_then(|v| v.as_str())?;

    let action = payload.pointer("/actions/0");
    let action_id = action
        .and_then(|a| a.get("action_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let value = action
        .and_then(|a| {
            a.get("value")
                .or_else(|| a.pointer("/selected_option/value"))
        })
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let mut envelope = EventEnvelope::new(
        EventType::Reaction,
        Platform::Slack,
        team.to_string(),
        channel.to_string(),
        user,
    )
    .with_meta("interaction", "block_actions")
    .with_meta("action_id", action_id)
    .with_meta("value", value);

    if let Some(ts) = payload.pointer("/message/ts").and_then(|v| v.as_str()) {
        envelope = envelope.with_meta("ts", ts);
    }
    if let Some(username) = payload.pointer("/user/username").and_then(|v| v.as_str()) {
        envelope = envelope.with_username(username);
    }
    Some(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_verification_echoes_challenge() {
        let body = serde_json::json!({"type": "url_verification", "challenge": "abc123"});
        match handle_event_body(&body) {
            SlackInbound::Challenge(c) => assert_eq!(c, "abc123"),
            _ => panic!("expected challenge"),
        }
    }

    #[test]
    fn message_event_maps_to_chat() {
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T123",
            "event": {
                "type": "message",
                "channel": "C456",
                "user": "U789",
                "text": "!help please",
                "ts": "1699999999.000100",
            }
        });
        match handle_event_body(&body) {
            SlackInbound::Event(envelope) => {
                assert_eq!(envelope.event_type, EventType::ChatMessage);
                assert_eq!(envelope.entity_id.as_str(), "slack:T123:C456");
                assert_eq!(envelope.message, "!help please");
                assert_eq!(envelope.metadata["ts"], "1699999999.000100");
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn bot_echoes_are_ignored() {
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T123",
            "event": {
                "type": "message",
                "channel": "C456",
                "user": "U789",
                "bot_id": "B001",
                "text": "I am the bot",
            }
        });
        assert!(matches!(handle_event_body(&body), SlackInbound::Ignored));
    }

    #[test]
    fn unknown_events_become_unknown_envelopes() {
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T123",
            "event": {"type": "emoji_changed", "user": "U1"}
        });
        match handle_event_body(&body) {
            SlackInbound::Event(envelope) => {
                assert_eq!(envelope.event_type, EventType::Unknown);
                assert!(envelope.metadata.contains_key("raw"));
            }
            _ => panic!("unknown events must not be dropped"),
        }
    }

    #[test]
    fn block_action_carries_action_id_and_value() {
        let payload = serde_json::json!({
            "type": "block_actions",
            "team": {"id": "T123"},
            "channel": {"id": "C456"},
            "user": {"id": "U789", "username": "alice"},
            "message": {"ts": "1699999999.000100"},
            "actions": [{"action_id": "approve_btn", "value": "yes"}],
        });
        let envelope = envelope_from_interaction(&payload).unwrap();
        assert_eq!(envelope.event_type, EventType::Reaction);
        assert_eq!(envelope.metadata["action_id"], "approve_btn");
        assert_eq!(envelope.metadata["value"], "yes");
        assert_eq!(envelope.username, "alice");
    }
}
