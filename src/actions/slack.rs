//! Slack action pusher over the Web API.

use crate::actions::traits::{ActionPusher, PushRequest};
use crate::error::{Result, RouterError};
use crate::{EntityId, Platform};

use async_trait::async_trait;

const API_BASE: &str = "https://slack.com/api";

pub struct SlackPusher {
    http: reqwest::Client,
    bot_token: String,
}

impl SlackPusher {
    pub fn new(bot_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
        }
    }

    fn channel_of(entity_id: &EntityId) -> Result<String> {
        entity_id
            .parts()
            .map(|(_, _, channel)| {
                // Thread entities carry `<channel>:<ts>`; the API wants the
                // bare channel id.
                channel.split(':').next().unwrap_or(channel).to_string()
            })
            .ok_or_else(|| {
                RouterError::Validation(format!("bad slack entity {entity_id}")).into()
            })
    }

    async fn api_call(&self, method: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(format!("{API_BASE}/{method}"))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::DispatchFailed {
                target: method.to_string(),
                reason: e.to_string(),
            })?;

        let payload: serde_json::Value =
            response.json().await.map_err(|e| RouterError::DispatchFailed {
                target: method.to_string(),
                reason: e.to_string(),
            })?;

        if !payload.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(RouterError::DispatchFailed {
                target: method.to_string(),
                reason: payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown slack error")
                    .to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ActionPusher for SlackPusher {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn push(&self, request: &PushRequest) -> Result<()> {
        let channel = Self::channel_of(request.entity_id())?;

        match request {
            PushRequest::Chat { message, .. } => {
                self.api_call(
                    "chat.postMessage",
                    serde_json::json!({"channel": channel, "text": message}),
                )
                .await
            }
            PushRequest::DeleteMessage { message_id, .. } => {
                self.api_call(
                    "chat.delete",
                    serde_json::json!({"channel": channel, "ts": message_id}),
                )
                .await
            }
            PushRequest::Timeout { user_id, .. } | PushRequest::Ban { user_id, .. } => {
                // Slack has no timeout/ban; removal from the channel is the
                // closest enforcement.
                self.api_call(
                    "conversations.kick",
                    serde_json::json!({"channel": channel, "user": user_id}),
                )
                .await
            }
        }
    }
}
