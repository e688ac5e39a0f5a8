//! Stream names and wire formats.
//!
//! Every stream message carries exactly two fields: `event_id` and `payload`
//! (the JSON envelope). Producers key by `entity_id` so per-entity order is
//! preserved end-to-end; cross-entity order is not guaranteed.

use crate::EventEnvelope;
use serde::{Deserialize, Serialize};

/// Receivers -> router.
pub const INBOUND: &str = "events:inbound";
/// Router -> interaction modules (recognized commands).
pub const COMMANDS: &str = "events:commands";
/// Router/workflow -> action pushers.
pub const ACTIONS: &str = "events:actions";
/// Action pushers / interaction modules -> router.
pub const RESPONSES: &str = "events:responses";

/// Dead-letter stream name for a primary stream:
/// `events:inbound` -> `events:dlq:inbound`.
pub fn dlq_stream(primary: &str) -> String {
    match primary.strip_prefix("events:") {
        Some(rest) => format!("events:dlq:{rest}"),
        None => format!("dlq:{primary}"),
    }
}

/// One claimed entry from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Substrate-assigned entry id (used for acks).
    pub id: String,
    /// The envelope's event id, duplicated as its own field for cheap dedupe.
    pub event_id: String,
    /// JSON-encoded envelope.
    pub payload: String,
    /// How many times this entry has been delivered (1 on first delivery).
    pub delivery_count: u64,
}

impl StreamEntry {
    pub fn envelope(&self) -> std::result::Result<EventEnvelope, String> {
        serde_json::from_str(&self.payload).map_err(|e| e.to_string())
    }

    /// Retries so far: deliveries beyond the first.
    pub fn retry_count(&self) -> u32 {
        self.delivery_count.saturating_sub(1) as u32
    }
}

/// Payload written to a dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: String,
    /// The original envelope, verbatim (kept as raw JSON so malformed
    /// payloads survive into the DLQ for inspection).
    pub original_event: serde_json::Value,
    pub failure_reason: String,
    pub retry_count: u32,
    pub original_stream: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DeadLetter {
    pub fn from_entry(entry: &StreamEntry, stream: &str, reason: impl Into<String>) -> Self {
        let original_event = serde_json::from_str(&entry.payload)
            .unwrap_or(serde_json::Value::String(entry.payload.clone()));
        DeadLetter {
            event_id: entry.event_id.clone(),
            original_event,
            failure_reason: reason.into(),
            retry_count: entry.retry_count(),
            original_stream: stream.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventEnvelope, EventType, Platform};

    #[test]
    fn dlq_names_follow_the_contract() {
        assert_eq!(dlq_stream(INBOUND), "events:dlq:inbound");
        assert_eq!(dlq_stream(RESPONSES), "events:dlq:responses");
        assert_eq!(dlq_stream("custom"), "dlq:custom");
    }

    #[test]
    fn entry_round_trips_envelope() {
        let envelope =
            EventEnvelope::new(EventType::ChatMessage, Platform::Twitch, "foo", "1", "u1")
                .with_message("hi");
        let entry = StreamEntry {
            id: "1-0".into(),
            event_id: envelope.event_id.clone(),
            payload: serde_json::to_string(&envelope).unwrap(),
            delivery_count: 1,
        };
        let decoded = entry.envelope().unwrap();
        assert_eq!(decoded.event_id, envelope.event_id);
        assert_eq!(entry.retry_count(), 0);
    }

    #[test]
    fn dead_letter_keeps_malformed_payloads() {
        let entry = StreamEntry {
            id: "1-0".into(),
            event_id: "evt".into(),
            payload: "{not json".into(),
            delivery_count: 3,
        };
        let letter = DeadLetter::from_entry(&entry, INBOUND, "parse failure");
        assert_eq!(letter.retry_count, 2);
        assert_eq!(letter.original_stream, INBOUND);
        assert_eq!(
            letter.original_event,
            serde_json::Value::String("{not json".into())
        );
    }
}
