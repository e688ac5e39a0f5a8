//! Twitch receiver: IRC chat socket plus EventSub webhook mapping, with a
//! database-backed OAuth token manager.

use crate::config::TwitchConfig;
use crate::db::{Db, format_ts, parse_ts};
use crate::error::{ReceiverError, Result};
use crate::receivers::discovery::ChannelDirectory;
use crate::receivers::traits::{EnvelopeStream, Receiver};
use crate::{EventEnvelope, EventType, Platform};

use anyhow::Context as _;
use sqlx::Row as _;
use twitch_irc::login::StaticLoginCredentials;
use twitch_irc::message::ServerMessage;
use twitch_irc::{ClientConfig, SecureTCPTransport, TwitchIRCClient};

use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

type IrcClient = TwitchIRCClient<SecureTCPTransport, StaticLoginCredentials>;

/// Twitch chat receiver state.
pub struct TwitchReceiver {
    config: TwitchConfig,
    directory: Arc<ChannelDirectory>,
    client: Arc<RwLock<Option<IrcClient>>>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl TwitchReceiver {
    pub fn new(config: TwitchConfig, directory: Arc<ChannelDirectory>) -> Self {
        Self {
            config,
            directory,
            client: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

}

/// Join channels added to the routing table since connect. twitch-irc treats
/// re-joining a joined channel as a no-op, so the whole snapshot is applied
/// each pass.
async fn sync_channels(
    client_slot: &RwLock<Option<IrcClient>>,
    directory: &ChannelDirectory,
) {
    let client_guard = client_slot.read().await;
    let Some(client) = client_guard.as_ref() else {
        return;
    };
    for attachment in directory.for_platform(Platform::Twitch) {
        let login = attachment.channel_id.trim_start_matches('#').to_string();
        if let Err(error) = client.join(login.clone()) {
            tracing::error!(channel = %login, %error, "failed to join twitch channel");
        }
    }
}

impl Receiver for TwitchReceiver {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    async fn start(&self) -> Result<EnvelopeStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        // Strip "oauth:" prefix if the operator included it
        let token = self
            .config
            .oauth_token
            .strip_prefix("oauth:")
            .unwrap_or(&self.config.oauth_token)
            .to_string();

        let credentials =
            StaticLoginCredentials::new(self.config.bot_username.clone(), Some(token));
        let irc_config = ClientConfig::new_simple(credentials);

        let (mut incoming, client) =
            TwitchIRCClient::<SecureTCPTransport, StaticLoginCredentials>::new(irc_config);

        let attachments = self.directory.for_platform(Platform::Twitch);
        for attachment in &attachments {
            let login = attachment.channel_id.trim_start_matches('#').to_string();
            if let Err(error) = client.join(login.clone()) {
                tracing::error!(channel = %login, %error, "failed to join twitch channel");
            }
        }

        tracing::info!(
            username = %self.config.bot_username,
            channels = attachments.len(),
            "twitch connected"
        );

        *self.client.write().await = Some(client);

        // Periodic resync so dynamic joins/leaves in the routing table take
        // effect without a restart.
        {
            let client_slot = self.client.clone();
            let directory = self.directory.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(300));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if client_slot.read().await.is_none() {
                        break;
                    }
                    sync_channels(&client_slot, &directory).await;
                }
            });
        }

        let bot_username = self.config.bot_username.to_lowercase();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("twitch message loop shutting down");
                        break;
                    }
                    message = incoming.recv() => {
                        let Some(message) = message else {
                            tracing::info!("twitch incoming stream ended");
                            break;
                        };

                        let Some(envelope) = envelope_from_irc(message, &bot_username) else {
                            continue;
                        };

                        if let Err(error) = inbound_tx.send(envelope).await {
                            tracing::warn!(
                                %error,
                                "failed to forward twitch envelope (receiver dropped)"
                            );
                            return;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<()> {
        let client_guard = self.client.read().await;
        if client_guard.is_none() {
            return Err(anyhow::anyhow!("twitch client not connected").into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }
        *self.client.write().await = None;
        tracing::info!("twitch receiver shut down");
        Ok(())
    }
}

/// Map an IRC server message to the canonical envelope. Messages from the
/// bot itself are dropped.
fn envelope_from_irc(message: ServerMessage, bot_username: &str) -> Option<EventEnvelope> {
    let ServerMessage::Privmsg(privmsg) = message else {
        return None;
    };
    if privmsg.sender.login.to_lowercase() == bot_username {
        return None;
    }

    let channel_login = privmsg.channel_login.clone();
    let mut envelope = EventEnvelope::new(
        EventType::ChatMessage,
        Platform::Twitch,
        channel_login.clone(),
        channel_login,
        privmsg.sender.id.clone(),
    )
    .with_username(privmsg.sender.login.clone())
    .with_message(privmsg.message_text.clone())
    .with_meta("message_id", privmsg.message_id.clone());
    envelope.display_name = privmsg.sender.name.clone();
    envelope.timestamp = privmsg.server_timestamp;

    let badges: Vec<String> = privmsg
        .badges
        .iter()
        .map(|b| format!("{}/{}", b.name, b.version))
        .collect();
    let is_mod = badges.iter().any(|b| b.starts_with("moderator/"));
    let is_broadcaster = badges.iter().any(|b| b.starts_with("broadcaster/"));
    envelope = envelope
        .with_meta("badges", serde_json::json!(badges))
        .with_meta("is_mod", is_mod)
        .with_meta("is_broadcaster", is_broadcaster);

    if let Some(bits) = privmsg.bits {
        envelope.event_type = EventType::Cheer;
        envelope = envelope.with_meta("bits", bits);
    }

    Some(envelope)
}

/// Map an EventSub notification body to the canonical envelope.
///
/// Unknown subscription types still produce an envelope
/// (`event_type=unknown`) with the payload preserved in `metadata.raw`.
pub fn envelope_from_eventsub(body: &serde_json::Value) -> Option<EventEnvelope> {
    let subscription_type = body
        .pointer("/subscription/type")
        .and_then(|v| v.as_str())?;
    let event = body.get("event")?;

    let channel = event
        .get("broadcaster_user_login")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let user_id = event
        .get("user_id")
        .or_else(|| event.get("from_broadcaster_user_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let username = event
        .get("user_login")
        .or_else(|| event.get("from_broadcaster_user_login"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let (event_type, extra): (EventType, Vec<(&str, serde_json::Value)>) = match subscription_type
    {
        "channel.follow" => (EventType::Follow, vec![]),
        "channel.subscribe" => (
            EventType::Subscription,
            vec![("tier", event.get("tier").cloned().unwrap_or_default())],
        ),
        "channel.subscription.gift" => (
            EventType::Subgift,
            vec![("total", event.get("total").cloned().unwrap_or_default())],
        ),
        "channel.subscription.message" => (
            EventType::Resub,
            vec![("tier", event.get("tier").cloned().unwrap_or_default())],
        ),
        "channel.cheer" => (
            EventType::Cheer,
            vec![("bits", event.get("bits").cloned().unwrap_or_default())],
        ),
        "channel.raid" => (
            EventType::Raid,
            vec![(
                "viewer_count",
                event.get("viewers").cloned().unwrap_or_default(),
            )],
        ),
        "channel.ban" => (EventType::Ban, vec![]),
        _ => (
            EventType::Unknown,
            vec![("raw", body.clone())],
        ),
    };

    let mut envelope = EventEnvelope::new(
        event_type,
        Platform::Twitch,
        channel.to_string(),
        channel.to_string(),
        user_id,
    )
    .with_username(username)
    .with_meta("subscription_type", subscription_type);
    for (key, value) in extra {
        envelope = envelope.with_meta(key, value);
    }
    Some(envelope)
}

/// Manages Twitch OAuth tokens with automatic refresh.
///
/// Tokens expiring within the buffer window are refreshed against the Twitch
/// token endpoint and persisted atomically before being handed out.
pub struct TokenManager {
    db: Db,
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    buffer_secs: u64,
}

#[derive(Debug, serde::Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3_600
}

impl TokenManager {
    pub fn new(db: Db, config: &TwitchConfig) -> Self {
        Self {
            db,
            http: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url: "https://id.twitch.tv/oauth2/token".into(),
            buffer_secs: config.token_refresh_buffer_secs,
        }
    }

    #[cfg(test)]
    fn with_token_url(mut self, url: String) -> Self {
        self.token_url = url;
        self
    }

    /// Store an initial token pair for a broadcaster.
    pub async fn store(
        &self,
        broadcaster_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::seconds(expires_in_secs as i64);
        sqlx::query(
            "INSERT INTO twitch_tokens \
             (broadcaster_id, access_token, refresh_token, expires_at, scopes, last_refreshed) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (broadcaster_id) DO UPDATE SET \
             access_token = $7, refresh_token = $8, expires_at = $9, last_refreshed = $10",
        )
        .bind(broadcaster_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(format_ts(expires_at))
        .bind("")
        .bind(format_ts(now))
        .bind(access_token)
        .bind(refresh_token)
        .bind(format_ts(expires_at))
        .bind(format_ts(now))
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    /// Valid access token for a broadcaster, refreshing when it expires
    /// within the buffer window.
    pub async fn get_token(&self, broadcaster_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, expires_at FROM twitch_tokens \
             WHERE broadcaster_id = $1",
        )
        .bind(broadcaster_id)
        .fetch_optional(self.db.read())
        .await?;

        let Some(row) = row else {
            tracing::warn!(broadcaster_id, "no twitch token on file");
            return Ok(None);
        };

        let access_token: String = row.get("access_token");
        let refresh_token: String = row.get("refresh_token");
        let expires_at = parse_ts(&row.get::<String, _>("expires_at"))
            .unwrap_or_else(chrono::Utc::now);

        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(self.buffer_secs as i64);
        if expires_at > cutoff {
            return Ok(Some(access_token));
        }

        tracing::info!(broadcaster_id, "twitch token near expiry, refreshing");
        self.refresh(broadcaster_id, &refresh_token).await.map(Some)
    }

    async fn refresh(&self, broadcaster_id: &str, refresh_token: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| ReceiverError::TokenRefresh(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReceiverError::TokenRefresh(format!(
                "status {}",
                response.status()
            ))
            .into());
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ReceiverError::TokenRefresh(e.to_string()))?;

        let new_refresh = refreshed
            .refresh_token
            .as_deref()
            .unwrap_or(refresh_token);
        self.store(
            broadcaster_id,
            &refreshed.access_token,
            new_refresh,
            refreshed.expires_in,
        )
        .await
        .context("persisting refreshed token")?;

        Ok(refreshed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TwitchConfig;
    use crate::db::test_db;

    fn config() -> TwitchConfig {
        TwitchConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            bot_username: "waddlebot".into(),
            bot_user_id: "4242".into(),
            oauth_token: "oauth:abc".into(),
            eventsub_secret: "es".into(),
            token_refresh_buffer_secs: 300,
        }
    }

    #[tokio::test]
    async fn fresh_tokens_are_returned_without_refresh() {
        let manager = TokenManager::new(test_db().await, &config())
            .with_token_url("http://127.0.0.1:1/unreachable".into());
        manager.store("b1", "tok", "ref", 3_600).await.unwrap();

        let token = manager.get_token("b1").await.unwrap();
        assert_eq!(token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn near_expiry_token_triggers_refresh_attempt() {
        let manager = TokenManager::new(test_db().await, &config())
            .with_token_url("http://127.0.0.1:1/unreachable".into());
        // Expires inside the 300 s buffer: the manager must try to refresh,
        // and the unreachable endpoint surfaces as a TokenRefresh error.
        manager.store("b1", "tok", "ref", 60).await.unwrap();

        let error = manager.get_token("b1").await.unwrap_err();
        assert!(error.to_string().contains("token refresh"));
    }

    #[tokio::test]
    async fn unknown_broadcaster_is_none() {
        let manager = TokenManager::new(test_db().await, &config());
        assert!(manager.get_token("missing").await.unwrap().is_none());
    }

    #[test]
    fn eventsub_follow_maps_to_envelope() {
        let body = serde_json::json!({
            "subscription": {"type": "channel.follow"},
            "event": {
                "user_id": "u1",
                "user_login": "alice",
                "broadcaster_user_login": "foo",
            }
        });
        let envelope = envelope_from_eventsub(&body).unwrap();
        assert_eq!(envelope.event_type, EventType::Follow);
        assert_eq!(envelope.platform, Platform::Twitch);
        assert_eq!(envelope.entity_id.as_str(), "twitch:foo:foo");
        assert_eq!(envelope.user_id, "u1");
        assert_eq!(envelope.username, "alice");
    }

    #[test]
    fn eventsub_raid_carries_viewer_count() {
        let body = serde_json::json!({
            "subscription": {"type": "channel.raid"},
            "event": {
                "from_broadcaster_user_id": "raider",
                "from_broadcaster_user_login": "raidleader",
                "broadcaster_user_login": "foo",
                "viewers": 250,
            }
        });
        let envelope = envelope_from_eventsub(&body).unwrap();
        assert_eq!(envelope.event_type, EventType::Raid);
        assert_eq!(envelope.viewer_count(), Some(250));
    }

    #[test]
    fn unknown_eventsub_types_are_preserved_not_dropped() {
        let body = serde_json::json!({
            "subscription": {"type": "channel.hype_train.begin"},
            "event": {"broadcaster_user_login": "foo", "user_id": "u1"},
        });
        let envelope = envelope_from_eventsub(&body).unwrap();
        assert_eq!(envelope.event_type, EventType::Unknown);
        assert!(envelope.metadata.contains_key("raw"));
    }
}
