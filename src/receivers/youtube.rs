//! YouTube Live receiver: live-chat polling at the server-returned interval,
//! plus PubSubHubbub notification parsing for stream lifecycle events.

use crate::config::YoutubeConfig;
use crate::error::{ReceiverError, Result};
use crate::receivers::discovery::ChannelDirectory;
use crate::receivers::traits::{EnvelopeStream, Receiver};
use crate::receivers::webhook::websub_channel_id;
use crate::{EventEnvelope, EventType, Platform};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// One actively polled live chat.
#[derive(Debug, Clone, Default)]
struct ActiveChat {
    live_chat_id: String,
    page_token: Option<String>,
    poll_interval_ms: u64,
    error_count: u32,
}

pub struct YoutubeReceiver {
    api_key: String,
    http: reqwest::Client,
    directory: Arc<ChannelDirectory>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl YoutubeReceiver {
    pub fn new(config: &YoutubeConfig, directory: Arc<ChannelDirectory>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client with static config"),
            directory,
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Find the active live chat for a channel, if it is live.
    async fn find_live_chat(&self, channel_id: &str) -> Result<Option<String>> {
        // search.list for an active broadcast, then videos.list for its chat id.
        let search: serde_json::Value = self
            .http
            .get(format!("{API_BASE}/search"))
            .query(&[
                ("part", "id"),
                ("channelId", channel_id),
                ("eventType", "live"),
                ("type", "video"),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(connection_error)?
            .json()
            .await
            .map_err(connection_error)?;

        let Some(video_id) = search
            .pointer("/items/0/id/videoId")
            .and_then(|v| v.as_str())
        else {
            return Ok(None);
        };

        let videos: serde_json::Value = self
            .http
            .get(format!("{API_BASE}/videos"))
            .query(&[
                ("part", "liveStreamingDetails"),
                ("id", video_id),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(connection_error)?
            .json()
            .await
            .map_err(connection_error)?;

        Ok(videos
            .pointer("/items/0/liveStreamingDetails/activeLiveChatId")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// Poll one chat page; returns the envelopes and updates paging state.
    async fn poll_chat(
        &self,
        channel_id: &str,
        chat: &mut ActiveChat,
    ) -> Result<Vec<EventEnvelope>> {
        let mut query: Vec<(&str, String)> = vec![
            ("part", "snippet,authorDetails".into()),
            ("liveChatId", chat.live_chat_id.clone()),
            ("key", self.api_key.clone()),
        ];
        if let Some(token) = &chat.page_token {
            query.push(("pageToken", token.clone()));
        }

        let body: serde_json::Value = self
            .http
            .get(format!("{API_BASE}/liveChat/messages"))
            .query(&query)
            .send()
            .await
            .map_err(connection_error)?
            .json()
            .await
            .map_err(connection_error)?;

        chat.page_token = body
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        // Honor the server-directed interval.
        chat.poll_interval_ms = body
            .get("pollingIntervalMillis")
            .and_then(|v| v.as_u64())
            .unwrap_or(5_000);

        let items = body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|item| envelope_from_chat_item(channel_id, item))
            .collect())
    }
}

impl Receiver for YoutubeReceiver {
    fn platform(&self) -> Platform {
        Platform::Youtube
    }

    async fn start(&self) -> Result<EnvelopeStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let receiver = YoutubeReceiver {
            api_key: self.api_key.clone(),
            http: self.http.clone(),
            directory: self.directory.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(async move {
            let mut chats: HashMap<String, ActiveChat> = HashMap::new();
            let mut due: HashMap<String, tokio::time::Instant> = HashMap::new();
            let mut discovery = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("youtube poll loop shutting down");
                        break;
                    }
                    // Attach chats for channels that went live.
                    _ = discovery.tick() => {
                        for attachment in receiver.directory.for_platform(Platform::Youtube) {
                            let channel_id = attachment.channel_id.clone();
                            if chats.contains_key(&channel_id) {
                                continue;
                            }
                            match receiver.find_live_chat(&channel_id).await {
                                Ok(Some(live_chat_id)) => {
                                    tracing::info!(channel_id = %channel_id, "youtube live chat attached");
                                    chats.insert(channel_id.clone(), ActiveChat {
                                        live_chat_id,
                                        poll_interval_ms: 5_000,
                                        ..Default::default()
                                    });
                                    due.insert(channel_id, tokio::time::Instant::now());
                                }
                                Ok(None) => {}
                                Err(error) => {
                                    tracing::debug!(%error, channel_id = %channel_id, "live chat lookup failed");
                                }
                            }
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }

                // Poll chats whose server-directed interval has elapsed.
                let now = tokio::time::Instant::now();
                let mut ended = Vec::new();
                for (channel_id, chat) in chats.iter_mut() {
                    if due.get(channel_id).is_some_and(|at| *at > now) {
                        continue;
                    }
                    match receiver.poll_chat(channel_id, chat).await {
                        Ok(envelopes) => {
                            chat.error_count = 0;
                            for envelope in envelopes {
                                if inbound_tx.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(error) => {
                            chat.error_count += 1;
                            tracing::warn!(%error, channel_id = %channel_id, "chat poll failed");
                            if chat.error_count >= 5 {
                                ended.push(channel_id.clone());
                            }
                        }
                    }
                    due.insert(
                        channel_id.clone(),
                        now + Duration::from_millis(chat.poll_interval_ms.max(200)),
                    );
                }
                for channel_id in ended {
                    tracing::info!(channel_id = %channel_id, "youtube live chat detached");
                    chats.remove(&channel_id);
                    due.remove(&channel_id);
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<()> {
        if self.shutdown_tx.read().await.is_none() {
            return Err(anyhow::anyhow!("youtube poller not started").into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }
        tracing::info!("youtube receiver shut down");
        Ok(())
    }
}

fn connection_error(e: reqwest::Error) -> ReceiverError {
    ReceiverError::Connection {
        platform: "youtube".into(),
        reason: e.to_string(),
    }
}

/// Map one liveChatMessage resource to the canonical envelope.
fn envelope_from_chat_item(
    channel_id: &str,
    item: &serde_json::Value,
) -> Option<EventEnvelope> {
    let snippet = item.get("snippet")?;
    let author = item.get("authorDetails")?;
    let message_type = snippet.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let (event_type, message) = match message_type {
        "textMessageEvent" => (
            EventType::ChatMessage,
            snippet
                .pointer("/textMessageDetails/messageText")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "superChatEvent" => (
            EventType::Donation,
            snippet
                .pointer("/superChatDetails/userComment")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        ),
        "newSponsorEvent" => (EventType::Subscription, String::new()),
        _ => (EventType::Unknown, String::new()),
    };

    let mut envelope = EventEnvelope::new(
        event_type,
        Platform::Youtube,
        channel_id.to_string(),
        channel_id.to_string(),
        author
            .get("channelId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown"),
    )
    .with_username(
        author
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or(""),
    )
    .with_message(message)
    .with_meta(
        "is_moderator",
        author
            .get("isChatModerator")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    );

    if event_type == EventType::Unknown {
        envelope = envelope.with_meta("raw", item.clone());
    }
    if let Some(amount) = snippet
        .pointer("/superChatDetails/amountMicros")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
    {
        envelope = envelope.with_meta("amount", amount / 1_000_000.0);
    }
    Some(envelope)
}

/// Parse a PubSubHubbub Atom notification into a stream-lifecycle envelope.
///
/// The feed is small and fixed-shape; the video and channel ids are pulled
/// from their dedicated elements.
pub fn envelope_from_websub_notification(body: &str) -> Option<EventEnvelope> {
    let video_id = extract_tag(body, "yt:videoId")?;
    let channel_id = extract_tag(body, "yt:channelId")?;
    let title = extract_tag(body, "title").unwrap_or_default();

    Some(
        EventEnvelope::new(
            EventType::Unknown,
            Platform::Youtube,
            channel_id.clone(),
            channel_id,
            "youtube",
        )
        .with_meta("notification", "video_published")
        .with_meta("video_id", video_id)
        .with_meta("title", title),
    )
}

fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}

/// Re-exported topic-id helper so webhook routes resolve the channel.
pub fn channel_from_topic(topic: &str) -> Option<&str> {
    websub_channel_id(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_item_maps_to_envelope() {
        let item = serde_json::json!({
            "snippet": {
                "type": "textMessageEvent",
                "textMessageDetails": {"messageText": "hello stream"},
            },
            "authorDetails": {
                "channelId": "UCviewer",
                "displayName": "Viewer",
                "isChatModerator": false,
            }
        });
        let envelope = envelope_from_chat_item("UCstreamer", &item).unwrap();
        assert_eq!(envelope.event_type, EventType::ChatMessage);
        assert_eq!(envelope.message, "hello stream");
        assert_eq!(envelope.entity_id.as_str(), "youtube:UCstreamer:UCstreamer");
    }

    #[test]
    fn super_chat_carries_amount() {
        let item = serde_json::json!({
            "snippet": {
                "type": "superChatEvent",
                "superChatDetails": {
                    "userComment": "great stream!",
                    "amountMicros": "5000000",
                },
            },
            "authorDetails": {"channelId": "UCdonor", "displayName": "Donor"},
        });
        let envelope = envelope_from_chat_item("UCstreamer", &item).unwrap();
        assert_eq!(envelope.event_type, EventType::Donation);
        assert_eq!(envelope.donation_amount(), Some(5.0));
    }

    #[test]
    fn websub_notification_parses_atom() {
        let body = r#"<?xml version="1.0"?>
            <feed xmlns:yt="http://www.youtube.com/xml/schemas/2015">
              <entry>
                <yt:videoId>vid123</yt:videoId>
                <yt:channelId>UCabc</yt:channelId>
                <title>Going live!</title>
              </entry>
            </feed>"#;
        let envelope = envelope_from_websub_notification(body).unwrap();
        assert_eq!(envelope.metadata["video_id"], "vid123");
        assert_eq!(envelope.metadata["title"], "Going live!");
        assert_eq!(envelope.entity_id.as_str(), "youtube:UCabc:UCabc");
    }

    #[test]
    fn malformed_atom_yields_none() {
        assert!(envelope_from_websub_notification("<feed></feed>").is_none());
    }
}
