//! Twitch action pusher over the Helix API.

use crate::actions::traits::{ActionPusher, PushRequest};
use crate::error::{Result, RouterError};
use crate::receivers::twitch::TokenManager;
use crate::{EntityId, Platform};

use async_trait::async_trait;
use std::sync::Arc;

const HELIX_BASE: &str = "https://api.twitch.tv/helix";

pub struct TwitchPusher {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    client_id: String,
    /// The bot's own Twitch user id (sender/moderator in Helix calls).
    bot_user_id: String,
}

impl TwitchPusher {
    pub fn new(tokens: Arc<TokenManager>, client_id: String, bot_user_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            client_id,
            bot_user_id,
        }
    }

    fn broadcaster_of(entity_id: &EntityId) -> Result<String> {
        entity_id
            .parts()
            .map(|(_, _, channel)| channel.to_string())
            .ok_or_else(|| {
                RouterError::Validation(format!("bad twitch entity {entity_id}")).into()
            })
    }

    async fn token_for(&self, broadcaster_id: &str) -> Result<String> {
        self.tokens
            .get_token(broadcaster_id)
            .await?
            .ok_or_else(|| {
                RouterError::DispatchFailed {
                    target: format!("twitch:{broadcaster_id}"),
                    reason: "no oauth token on file".into(),
                }
                .into()
            })
    }

    async fn helix_post(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{HELIX_BASE}/{path}"))
            .bearer_auth(token)
            .header("Client-Id", &self.client_id)
            .query(query)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::DispatchFailed {
                target: path.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(RouterError::DispatchFailed {
                target: path.to_string(),
                reason: format!("helix status {}", response.status()),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ActionPusher for TwitchPusher {
    fn platform(&self) -> Platform {
        Platform::Twitch
    }

    async fn push(&self, request: &PushRequest) -> Result<()> {
        let broadcaster = Self::broadcaster_of(request.entity_id())?;
        let token = self.token_for(&broadcaster).await?;

        match request {
            PushRequest::Chat { message, .. } => {
                self.helix_post(
                    &token,
                    "chat/messages",
                    &[],
                    serde_json::json!({
                        "broadcaster_id": broadcaster,
                        "sender_id": self.bot_user_id,
                        "message": message,
                    }),
                )
                .await
            }
            PushRequest::Timeout {
                user_id,
                duration_minutes,
                reason,
                ..
            } => {
                self.helix_post(
                    &token,
                    "moderation/bans",
                    &[
                        ("broadcaster_id", broadcaster.as_str()),
                        ("moderator_id", self.bot_user_id.as_str()),
                    ],
                    serde_json::json!({
                        "data": {
                            "user_id": user_id,
                            "duration": duration_minutes * 60,
                            "reason": reason,
                        }
                    }),
                )
                .await
            }
            PushRequest::Ban {
                user_id, reason, ..
            } => {
                self.helix_post(
                    &token,
                    "moderation/bans",
                    &[
                        ("broadcaster_id", broadcaster.as_str()),
                        ("moderator_id", self.bot_user_id.as_str()),
                    ],
                    serde_json::json!({
                        "data": {"user_id": user_id, "reason": reason}
                    }),
                )
                .await
            }
            PushRequest::DeleteMessage { message_id, .. } => {
                let response = self
                    .http
                    .delete(format!("{HELIX_BASE}/moderation/chat"))
                    .bearer_auth(&token)
                    .header("Client-Id", &self.client_id)
                    .query(&[
                        ("broadcaster_id", broadcaster.as_str()),
                        ("moderator_id", self.bot_user_id.as_str()),
                        ("message_id", message_id.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| RouterError::DispatchFailed {
                        target: "moderation/chat".into(),
                        reason: e.to_string(),
                    })?;
                if !response.status().is_success() {
                    return Err(RouterError::DispatchFailed {
                        target: "moderation/chat".into(),
                        reason: format!("helix status {}", response.status()),
                    }
                    .into());
                }
                Ok(())
            }
        }
    }
}
