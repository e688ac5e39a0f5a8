//! Discord action pusher over the serenity HTTP client.

use crate::actions::traits::{ActionPusher, PushRequest};
use crate::error::{Result, RouterError};
use crate::{EntityId, Platform};

use async_trait::async_trait;
use serenity::all::{ChannelId, EditMember, GuildId, MessageId, Timestamp, UserId};
use serenity::http::Http;
use std::sync::Arc;

pub struct DiscordPusher {
    http: Arc<Http>,
}

impl DiscordPusher {
    pub fn new(bot_token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(bot_token)),
        }
    }

    fn ids_of(entity_id: &EntityId) -> Result<(GuildId, ChannelId)> {
        let (_, server, channel) = entity_id.parts().ok_or_else(|| {
            crate::error::Error::from(RouterError::Validation(format!(
                "bad discord entity {entity_id}"
            )))
        })?;
        let guild: u64 = server.parse().map_err(|_| {
            RouterError::Validation(format!("bad discord guild id {server}"))
        })?;
        let channel: u64 = channel.parse().unwrap_or(guild);
        Ok((GuildId::new(guild), ChannelId::new(channel)))
    }
}

#[async_trait]
impl ActionPusher for DiscordPusher {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn push(&self, request: &PushRequest) -> Result<()> {
        let (guild_id, channel_id) = Self::ids_of(request.entity_id())?;

        match request {
            PushRequest::Chat { message, .. } => {
                channel_id
                    .say(&*self.http, message)
                    .await
                    .map_err(|e| RouterError::DispatchFailed {
                        target: channel_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            PushRequest::Timeout {
                user_id,
                duration_minutes,
                ..
            } => {
                let user: u64 = user_id.parse().map_err(|_| {
                    RouterError::Validation(format!("bad discord user id {user_id}"))
                })?;
                let until = chrono::Utc::now()
                    + chrono::Duration::minutes(*duration_minutes as i64);
                let timestamp =
                    Timestamp::from_unix_timestamp(until.timestamp()).map_err(|e| {
                        RouterError::Validation(format!("bad timeout timestamp: {e}"))
                    })?;
                guild_id
                    .edit_member(
                        &*self.http,
                        UserId::new(user),
                        EditMember::new().disable_communication_until_datetime(timestamp),
                    )
                    .await
                    .map_err(|e| RouterError::DispatchFailed {
                        target: guild_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            PushRequest::Ban {
                user_id, reason, ..
            } => {
                let user: u64 = user_id.parse().map_err(|_| {
                    RouterError::Validation(format!("bad discord user id {user_id}"))
                })?;
                guild_id
                    .ban_with_reason(&*self.http, UserId::new(user), 0, reason)
                    .await
                    .map_err(|e| RouterError::DispatchFailed {
                        target: guild_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            PushRequest::DeleteMessage { message_id, .. } => {
                let message: u64 = message_id.parse().map_err(|_| {
                    RouterError::Validation(format!("bad discord message id {message_id}"))
                })?;
                channel_id
                    .delete_message(&*self.http, MessageId::new(message))
                    .await
                    .map_err(|e| RouterError::DispatchFailed {
                        target: channel_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.http
            .get_current_user()
            .await
            .map_err(|e| RouterError::DispatchFailed {
                target: "discord".into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
