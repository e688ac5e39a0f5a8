//! Kick receiver: HMAC-signed webhooks plus the Pusher WebSocket chat feed.
//!
//! Kick's chat rides its public Pusher app; each chatroom is a channel named
//! `chatrooms.<id>.v2`. The socket task subscribes to every attached
//! chatroom and reconnects with a delay after errors.

use crate::config::KickConfig;
use crate::error::Result;
use crate::receivers::discovery::ChannelDirectory;
use crate::receivers::traits::{EnvelopeStream, Receiver};
use crate::{EventEnvelope, EventType, Platform};

use futures::{SinkExt as _, StreamExt as _};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct KickReceiver {
    config: KickConfig,
    directory: Arc<ChannelDirectory>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl KickReceiver {
    pub fn new(config: KickConfig, directory: Arc<ChannelDirectory>) -> Self {
        Self {
            config,
            directory,
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    fn socket_url(&self) -> String {
        format!(
            "wss://ws-{}.pusher.com/app/{}?protocol=7&client=waddlebot&version={}",
            self.config.pusher_cluster,
            self.config.pusher_key,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

impl Receiver for KickReceiver {
    fn platform(&self) -> Platform {
        Platform::Kick
    }

    async fn start(&self) -> Result<EnvelopeStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let url = self.socket_url();
        let directory = self.directory.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("kick socket loop shutting down");
                        break;
                    }
                    ended = run_socket(&url, &directory, &inbound_tx) => {
                        if let Err(error) = ended {
                            tracing::warn!(%error, "kick socket dropped, reconnecting");
                        }
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<()> {
        if self.shutdown_tx.read().await.is_none() {
            return Err(anyhow::anyhow!("kick socket not started").into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }
        tracing::info!("kick receiver shut down");
        Ok(())
    }
}

/// One socket lifetime: connect, subscribe to every attached chatroom,
/// forward events until the stream ends.
async fn run_socket(
    url: &str,
    directory: &ChannelDirectory,
    inbound_tx: &mpsc::Sender<EventEnvelope>,
) -> anyhow::Result<()> {
    let (socket, _) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();

    for attachment in directory.for_platform(Platform::Kick) {
        let subscribe = serde_json::json!({
            "event": "pusher:subscribe",
            "data": {"auth": "", "channel": format!("chatrooms.{}.v2", attachment.channel_id)},
        });
        sink.send(Message::text(subscribe.to_string())).await?;
    }
    tracing::info!("kick chat connected");

    while let Some(message) = stream.next().await {
        let message = message?;
        let Ok(text) = message.to_text() else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
            continue;
        };

        let event_name = frame.get("event").and_then(|v| v.as_str()).unwrap_or("");
        match event_name {
            "pusher:ping" => {
                sink.send(Message::text(
                    serde_json::json!({"event": "pusher:pong", "data": {}}).to_string(),
                ))
                .await?;
            }
            "pusher:connection_established" | "pusher_internal:subscription_succeeded" => {}
            "pusher:error" => {
                tracing::warn!(frame = %text, "pusher error frame");
            }
            _ => {
                // Payloads arrive as a JSON-encoded string in `data`.
                let data = frame
                    .get("data")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
                    .or_else(|| frame.get("data").cloned())
                    .unwrap_or(serde_json::Value::Null);

                if let Some(envelope) = envelope_from_pusher_event(event_name, &data)
                    && inbound_tx.send(envelope).await.is_err()
                {
                    return Ok(());
                }
            }
        }
    }

    anyhow::bail!("kick socket stream ended")
}

/// Map a Pusher chat event to the canonical envelope. Event class names come
/// namespaced (`App\Events\ChatMessageEvent`); match on the trailing name so
/// both forms work.
pub fn envelope_from_pusher_event(
    event_name: &str,
    data: &serde_json::Value,
) -> Option<EventEnvelope> {
    let short_name = event_name.rsplit('\\').next().unwrap_or(event_name);
    let chatroom_id = data
        .get("chatroom_id")
        .and_then(|v| v.as_u64())
        .or_else(|| data.pointer("/chatroom/id").and_then(|v| v.as_u64()))
        .map(|id| id.to_string())
        .unwrap_or_else(|| "0".to_string());

    let envelope = match short_name {
        "ChatMessageEvent" | "ChatMessage" => {
            let sender = data.get("sender")?;
            let identity = sender.get("identity");
            let mut envelope = EventEnvelope::new(
                EventType::ChatMessage,
                Platform::Kick,
                chatroom_id.clone(),
                chatroom_id,
                sender.get("id").and_then(|v| v.as_u64())?.to_string(),
            )
            .with_username(
                sender
                    .get("username")
                    .and_then(|v| v.as_str())
                    .unwrap_or(""),
            )
            .with_message(data.get("content").and_then(|v| v.as_str()).unwrap_or(""))
            .with_meta(
                "is_moderator",
                sender
                    .get("is_moderator")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            )
            .with_meta(
                "is_subscriber",
                sender
                    .get("is_subscriber")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            );
            if let Some(message_id) = data.get("id").and_then(|v| v.as_str()) {
                envelope = envelope.with_meta("message_id", message_id);
            }
            if let Some(identity) = identity {
                envelope = envelope.with_meta("identity", identity.clone());
            }
            envelope
        }
        "SubscriptionEvent" | "Subscription" => EventEnvelope::new(
            EventType::Subscription,
            Platform::Kick,
            chatroom_id.clone(),
            chatroom_id,
            data.get("username").and_then(|v| v.as_str()).unwrap_or("unknown"),
        )
        .with_username(data.get("username").and_then(|v| v.as_str()).unwrap_or(""))
        .with_meta(
            "months",
            data.get("months").and_then(|v| v.as_u64()).unwrap_or(1),
        ),
        "GiftedSubscriptionsEvent" | "GiftedSubscription" => EventEnvelope::new(
            EventType::Subgift,
            Platform::Kick,
            chatroom_id.clone(),
            chatroom_id,
            data.get("gifter_username")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
        )
        .with_username(
            data.get("gifter_username")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
        )
        .with_meta(
            "gifted_usernames",
            data.get("gifted_usernames").cloned().unwrap_or_default(),
        ),
        "UserBannedEvent" | "UserBanned" | "Ban" => EventEnvelope::new(
            EventType::Ban,
            Platform::Kick,
            chatroom_id.clone(),
            chatroom_id,
            data.pointer("/user/id")
                .and_then(|v| v.as_u64())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
        .with_username(
            data.pointer("/user/username")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
        ),
        "MessageDeletedEvent" | "MessageDeleted" => EventEnvelope::new(
            EventType::Unknown,
            Platform::Kick,
            chatroom_id.clone(),
            chatroom_id,
            "kick",
        )
        .with_meta("kick_event", "message_deleted")
        .with_meta("raw", data.clone()),
        _ => EventEnvelope::new(
            EventType::Unknown,
            Platform::Kick,
            chatroom_id.clone(),
            chatroom_id,
            "kick",
        )
        .with_meta("kick_event", short_name)
        .with_meta("raw", data.clone()),
    };

    Some(envelope)
}

/// Map an HMAC-verified webhook delivery to the canonical envelope.
pub fn envelope_from_webhook(event_type: &str, body: &serde_json::Value) -> Option<EventEnvelope> {
    let channel_id = body
        .get("channel_id")
        .and_then(|v| v.as_u64())
        .map(|id| id.to_string())
        .unwrap_or_else(|| "0".to_string());

    let envelope = match event_type {
        "chat.message.sent" => envelope_from_pusher_event("ChatMessageEvent", body)?,
        "channel.followed" => EventEnvelope::new(
            EventType::Follow,
            Platform::Kick,
            channel_id.clone(),
            channel_id,
            body.get("follower_id")
                .and_then(|v| v.as_u64())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
        .with_username(body.get("username").and_then(|v| v.as_str()).unwrap_or("")),
        "channel.subscription.new" | "channel.subscription.renewal" => {
            envelope_from_pusher_event("SubscriptionEvent", body)?
        }
        "channel.subscription.gifts" => {
            envelope_from_pusher_event("GiftedSubscriptionsEvent", body)?
        }
        "livestream.status.updated" => EventEnvelope::new(
            EventType::Unknown,
            Platform::Kick,
            channel_id.clone(),
            channel_id,
            "kick",
        )
        .with_meta("kick_event", "livestream_status")
        .with_meta("raw", body.clone()),
        _ => EventEnvelope::new(
            EventType::Unknown,
            Platform::Kick,
            channel_id.clone(),
            channel_id,
            "kick",
        )
        .with_meta("kick_event", event_type)
        .with_meta("raw", body.clone()),
    };
    Some(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_event_maps() {
        let data = serde_json::json!({
            "id": "msg-1",
            "chatroom_id": 4321,
            "content": "hello kick",
            "sender": {
                "id": 99,
                "username": "viewer",
                "slug": "viewer",
                "is_moderator": true,
                "is_subscriber": false,
            }
        });
        let envelope =
            envelope_from_pusher_event("App\\Events\\ChatMessageEvent", &data).unwrap();
        assert_eq!(envelope.event_type, EventType::ChatMessage);
        assert_eq!(envelope.entity_id.as_str(), "kick:4321:4321");
        assert_eq!(envelope.user_id, "99");
        assert_eq!(envelope.message, "hello kick");
        assert_eq!(envelope.metadata["is_moderator"], true);
    }

    #[test]
    fn gifted_subscription_maps_to_subgift() {
        let data = serde_json::json!({
            "chatroom_id": 4321,
            "gifter_username": "santa",
            "gifted_usernames": ["a", "b", "c"],
        });
        let envelope =
            envelope_from_pusher_event("App\\Events\\GiftedSubscriptionsEvent", &data).unwrap();
        assert_eq!(envelope.event_type, EventType::Subgift);
        assert_eq!(envelope.username, "santa");
    }

    #[test]
    fn unknown_pusher_events_are_preserved() {
        let data = serde_json::json!({"chatroom_id": 1});
        let envelope = envelope_from_pusher_event("App\\Events\\PollUpdateEvent", &data).unwrap();
        assert_eq!(envelope.event_type, EventType::Unknown);
        assert_eq!(envelope.metadata["kick_event"], "PollUpdateEvent");
        assert!(envelope.metadata.contains_key("raw"));
    }

    #[test]
    fn follow_webhook_maps() {
        let body = serde_json::json!({
            "channel_id": 777,
            "follower_id": 42,
            "username": "newfan",
        });
        let envelope = envelope_from_webhook("channel.followed", &body).unwrap();
        assert_eq!(envelope.event_type, EventType::Follow);
        assert_eq!(envelope.user_id, "42");
        assert_eq!(envelope.username, "newfan");
    }
}
