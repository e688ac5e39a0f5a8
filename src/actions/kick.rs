//! Kick action pusher over the public REST API.

use crate::actions::traits::{ActionPusher, PushRequest};
use crate::error::{Result, RouterError};
use crate::{EntityId, Platform};

use async_trait::async_trait;

const API_BASE: &str = "https://api.kick.com/public/v1";

pub struct KickPusher {
    http: reqwest::Client,
    access_token: String,
}

impl KickPusher {
    pub fn new(access_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token,
        }
    }

    fn channel_of(entity_id: &EntityId) -> Result<String> {
        entity_id
            .parts()
            .map(|(_, _, channel)| channel.to_string())
            .ok_or_else(|| {
                RouterError::Validation(format!("bad kick entity {entity_id}")).into()
            })
    }

    async fn api_post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(format!("{API_BASE}/{path}"))
            .bearer_auth(&self.access_token)
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
                reason: format!("kick status {}", response.status()),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ActionPusher for KickPusher {
    fn platform(&self) -> Platform {
        Platform::Kick
    }

    async fn push(&self, request: &PushRequest) -> Result<()> {
        let channel = Self::channel_of(request.entity_id())?;

        match request {
            PushRequest::Chat { message, .. } => {
                self.api_post(
                    "chat",
                    serde_json::json!({
                        "broadcaster_user_id": channel,
                        "type": "bot",
                        "content": message,
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
                self.api_post(
                    "moderation/bans",
                    serde_json::json!({
                        "broadcaster_user_id": channel,
                        "user_id": user_id,
                        "duration": duration_minutes,
                        "reason": reason,
                    }),
                )
                .await
            }
            PushRequest::Ban {
                user_id, reason, ..
            } => {
                self.api_post(
                    "moderation/bans",
                    serde_json::json!({
                        "broadcaster_user_id": channel,
                        "user_id": user_id,
                        "reason": reason,
                    }),
                )
                .await
            }
            PushRequest::DeleteMessage { .. } => {
                // Kick's public API has no message deletion yet; report the
                // gap instead of silently succeeding.
                Err(RouterError::DispatchFailed {
                    target: "kick".into(),
                    reason: "message deletion unsupported".into(),
                }
                .into())
            }
        }
    }
}
