//! WaddleBot: a multi-platform community bot core: event routing, reputation,
//! and platform ingest over a Redis-stream pipeline.

pub mod actions;
pub mod api;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod receivers;
pub mod reputation;
pub mod router;
pub mod telemetry;
pub mod translation;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Community identifier. The source systems disagree on int vs. string;
/// everything inside the pipeline is an `i64`, normalized at the boundary.
pub type CommunityId = i64;

/// Opaque session token minted by the router.
pub type SessionId = String;

/// Execution identifier for one command dispatch.
pub type ExecutionId = uuid::Uuid;

/// Source platform of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Discord,
    Slack,
    Youtube,
    Kick,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Discord => "discord",
            Platform::Slack => "slack",
            Platform::Youtube => "youtube",
            Platform::Kick => "kick",
            Platform::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Platform {
        match value.to_ascii_lowercase().as_str() {
            "twitch" => Platform::Twitch,
            "discord" => Platform::Discord,
            "slack" => Platform::Slack,
            "youtube" => Platform::Youtube,
            "kick" => Platform::Kick,
            _ => Platform::Unknown,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event kinds that traverse the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "chatMessage")]
    ChatMessage,
    Subscription,
    Follow,
    Donation,
    Cheer,
    Raid,
    Host,
    Subgift,
    Resub,
    Reaction,
    MemberJoin,
    MemberLeave,
    VoiceJoin,
    VoiceLeave,
    Boost,
    Ban,
    Kick,
    Timeout,
    Warn,
    FileShare,
    AppMention,
    ChannelJoin,
    Unknown,
}

impl EventType {
    /// The wire/storage name, identical to the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatMessage => "chatMessage",
            EventType::Subscription => "subscription",
            EventType::Follow => "follow",
            EventType::Donation => "donation",
            EventType::Cheer => "cheer",
            EventType::Raid => "raid",
            EventType::Host => "host",
            EventType::Subgift => "subgift",
            EventType::Resub => "resub",
            EventType::Reaction => "reaction",
            EventType::MemberJoin => "member_join",
            EventType::MemberLeave => "member_leave",
            EventType::VoiceJoin => "voice_join",
            EventType::VoiceLeave => "voice_leave",
            EventType::Boost => "boost",
            EventType::Ban => "ban",
            EventType::Kick => "kick",
            EventType::Timeout => "timeout",
            EventType::Warn => "warn",
            EventType::FileShare => "file_share",
            EventType::AppMention => "app_mention",
            EventType::ChannelJoin => "channel_join",
            EventType::Unknown => "unknown",
        }
    }

    /// Moderation events feed the reputation escalation ladder.
    pub fn is_moderation(&self) -> bool {
        matches!(
            self,
            EventType::Warn | EventType::Timeout | EventType::Kick | EventType::Ban
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routable platform surface: `<platform>:<server>:<channel>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(platform: Platform, server_id: &str, channel_id: &str) -> Self {
        EntityId(format!("{platform}:{server_id}:{channel_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(platform, server, channel)`. Channel may itself contain
    /// colons (Slack thread ids); only the first two separators split.
    pub fn parts(&self) -> Option<(Platform, &str, &str)> {
        let mut it = self.0.splitn(3, ':');
        let platform = Platform::parse(it.next()?);
        let server = it.next()?;
        let channel = it.next()?;
        Some((platform, server, channel))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maximum accepted chat message length.
pub const MAX_MESSAGE_LENGTH: usize = 5_000;

/// Shared v7 context so event ids stay monotonic within this source even
/// when several are minted in the same millisecond.
static EVENT_ID_CONTEXT: std::sync::LazyLock<std::sync::Mutex<uuid::ContextV7>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(uuid::ContextV7::new()));

/// Mint a time-ordered event id (ULID-like: sortable, unique, monotonic).
pub fn next_event_id() -> String {
    uuid::Uuid::new_v7(uuid::Timestamp::now(&*EVENT_ID_CONTEXT)).to_string()
}

/// The canonical event record that flows through every stream.
///
/// Created by a trigger receiver, immutable afterwards, delivered
/// at-least-once to every downstream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: EventType,
    pub platform: Platform,
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Build a new envelope with a fresh time-ordered event id.
    pub fn new(
        event_type: EventType,
        platform: Platform,
        server_id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let server_id = server_id.into();
        let channel_id = channel_id.into();
        EventEnvelope {
            event_id: next_event_id(),
            event_type,
            platform,
            entity_id: EntityId::new(platform, &server_id, &channel_id),
            server_id: Some(server_id),
            channel_id: Some(channel_id),
            user_id: user_id.into(),
            username: String::new(),
            display_name: String::new(),
            message: String::new(),
            timestamp: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        let username = username.into();
        if self.display_name.is_empty() {
            self.display_name = username.clone();
        }
        self.username = username;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Schema validation applied at every ingest boundary.
    ///
    /// `entity_id` must be derivable from `platform/server_id/channel_id`;
    /// when a receiver supplies both, they must agree.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.event_id.is_empty() {
            return Err("event_id is required".into());
        }
        if self.user_id.is_empty() {
            return Err("user_id is required".into());
        }
        if self.message.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(format!("message exceeds {MAX_MESSAGE_LENGTH} characters"));
        }
        let Some((platform, server, channel)) = self.entity_id.parts() else {
            return Err(format!(
                "entity_id '{}' is not <platform>:<server>:<channel>",
                self.entity_id
            ));
        };
        if platform != self.platform {
            return Err(format!(
                "entity_id platform '{platform}' disagrees with envelope platform '{}'",
                self.platform
            ));
        }
        if let Some(server_id) = &self.server_id {
            if server_id != server {
                return Err(format!(
                    "server_id '{server_id}' disagrees with entity_id server '{server}'"
                ));
            }
        }
        if let Some(channel_id) = &self.channel_id {
            if channel_id != channel {
                return Err(format!(
                    "channel_id '{channel_id}' disagrees with entity_id channel '{channel}'"
                ));
            }
        }
        Ok(())
    }

    // -- Typed metadata extractors --
    //
    // Metadata stays a structured-but-opaque carrier at the envelope layer;
    // subsystems that need typed values validate on entry.

    /// Donation amount in currency units.
    pub fn donation_amount(&self) -> Option<f64> {
        self.metadata.get("amount").and_then(value_as_f64)
    }

    /// Cheer size in bits.
    pub fn bits(&self) -> Option<u64> {
        self.metadata.get("bits").and_then(|v| v.as_u64())
    }

    /// Subscription tier (1, 2 or 3). Twitch sends plan codes "1000"/"2000"/"3000".
    pub fn sub_tier(&self) -> Option<u8> {
        let raw = self.metadata.get("tier")?;
        if let Some(n) = raw.as_u64() {
            return match n {
                1 | 1000 => Some(1),
                2 | 2000 => Some(2),
                3 | 3000 => Some(3),
                _ => None,
            };
        }
        match raw.as_str()? {
            "1" | "1000" | "Tier 1" => Some(1),
            "2" | "2000" | "Tier 2" => Some(2),
            "3" | "3000" | "Tier 3" => Some(3),
            _ => None,
        }
    }

    /// Raid party size.
    pub fn viewer_count(&self) -> Option<u64> {
        self.metadata.get("viewer_count").and_then(|v| v.as_u64())
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str().and_then(|s| s.parse().ok())
}

/// What the router should do with a module response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    Chat,
    Media,
    Ticker,
    General,
    #[default]
    None,
}

/// Callback body a module posts back to the router after executing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleResponse {
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    pub success: bool,
    #[serde(default)]
    pub response_action: ResponseAction,
    #[serde(default)]
    pub response_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_round_trip() {
        let json = serde_json::to_string(&EventType::ChatMessage).unwrap();
        assert_eq!(json, "\"chatMessage\"");
        let json = serde_json::to_string(&EventType::MemberJoin).unwrap();
        assert_eq!(json, "\"member_join\"");
        let back: EventType = serde_json::from_str("\"voice_leave\"").unwrap();
        assert_eq!(back, EventType::VoiceLeave);
    }

    #[test]
    fn entity_id_parts_split_on_first_two_colons() {
        let id = EntityId("slack:T123:C456:1699999999.000100".to_string());
        let (platform, server, channel) = id.parts().unwrap();
        assert_eq!(platform, Platform::Slack);
        assert_eq!(server, "T123");
        assert_eq!(channel, "C456:1699999999.000100");
    }

    #[test]
    fn envelope_validation_catches_disagreement() {
        let mut envelope = EventEnvelope::new(
            EventType::ChatMessage,
            Platform::Twitch,
            "channel",
            "123",
            "u1",
        );
        assert!(envelope.validate().is_ok());

        envelope.channel_id = Some("456".to_string());
        let error = envelope.validate().unwrap_err();
        assert!(error.contains("disagrees"));
    }

    #[test]
    fn envelope_rejects_oversized_message() {
        let envelope = EventEnvelope::new(
            EventType::ChatMessage,
            Platform::Twitch,
            "channel",
            "123",
            "u1",
        )
        .with_message("x".repeat(MAX_MESSAGE_LENGTH + 1));
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn envelope_json_matches_wire_shape() {
        let envelope = EventEnvelope::new(
            EventType::ChatMessage,
            Platform::Twitch,
            "channel",
            "123",
            "u1",
        )
        .with_username("alice")
        .with_message("!help me");

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "chatMessage");
        assert_eq!(value["platform"], "twitch");
        assert_eq!(value["entity_id"], "twitch:channel:123");
        assert_eq!(value["message"], "!help me");
    }

    #[test]
    fn sub_tier_accepts_twitch_plan_codes() {
        let envelope = EventEnvelope::new(
            EventType::Subscription,
            Platform::Twitch,
            "channel",
            "1",
            "u1",
        )
        .with_meta("tier", "2000");
        assert_eq!(envelope.sub_tier(), Some(2));
    }

    #[test]
    fn event_ids_are_monotonic_within_source() {
        let a = EventEnvelope::new(EventType::Follow, Platform::Kick, "s", "c", "u");
        let b = EventEnvelope::new(EventType::Follow, Platform::Kick, "s", "c", "u");
        assert!(a.event_id < b.event_id);
    }
}
