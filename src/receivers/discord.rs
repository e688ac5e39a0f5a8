//! Discord receiver using serenity.
//!
//! The gateway handler normalizes messages, slash commands, component
//! interactions, modals, membership churn, voice transitions, boosts, and
//! bans into canonical envelopes. Component and modal events carry the
//! originating session id in the custom_id state field when one was set.

use crate::config::DiscordConfig;
use crate::error::Result;
use crate::receivers::traits::{EnvelopeStream, Receiver};
use crate::{EventEnvelope, EventType, Platform};

use async_trait::async_trait;
use serenity::all::{
    Context, EventHandler, GatewayIntents, GuildId, GuildMemberUpdateEvent, Interaction, Member,
    Message, Ready, ShardManager, User, VoiceState,
};

use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Discord receiver state.
pub struct DiscordReceiver {
    token: String,
    bot_user_id: Arc<RwLock<Option<serenity::all::UserId>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordReceiver {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            token: config.bot_token.clone(),
            bot_user_id: Arc::new(RwLock::new(None)),
            shard_manager: Arc::new(RwLock::new(None)),
        }
    }
}

impl Receiver for DiscordReceiver {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn start(&self) -> Result<EnvelopeStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let handler = Handler {
            inbound_tx,
            bot_user_id_slot: self.bot_user_id.clone(),
        };

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_MEMBERS
            | GatewayIntents::GUILD_VOICE_STATES
            | GatewayIntents::GUILD_MODERATION;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| crate::error::ReceiverError::Connection {
                platform: "discord".into(),
                reason: e.to_string(),
            })?;

        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<()> {
        if self.shard_manager.read().await.is_none() {
            return Err(anyhow::anyhow!("discord gateway not connected").into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(manager) = self.shard_manager.read().await.as_ref() {
            manager.shutdown_all().await;
        }
        tracing::info!("discord receiver shut down");
        Ok(())
    }
}

// -- Serenity EventHandler --

struct Handler {
    inbound_tx: mpsc::Sender<EventEnvelope>,
    bot_user_id_slot: Arc<RwLock<Option<serenity::all::UserId>>>,
}

impl Handler {
    async fn forward(&self, envelope: EventEnvelope) {
        if let Err(error) = self.inbound_tx.send(envelope).await {
            tracing::warn!(%error, "failed to forward discord envelope (receiver dropped)");
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, guilds = ready.guilds.len(), "discord connected");
        *self.bot_user_id_slot.write().await = Some(ready.user.id);
    }

    async fn message(&self, _ctx: Context, message: Message) {
        // Always ignore our own messages to prevent self-response loops
        let bot_user_id = self.bot_user_id_slot.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return;
        }
        drop(bot_user_id);

        if message.author.bot {
            return;
        }

        let server = message
            .guild_id
            .map(|g| g.get().to_string())
            .unwrap_or_else(|| "dm".to_string());

        let mut envelope = EventEnvelope::new(
            EventType::ChatMessage,
            Platform::Discord,
            server,
            message.channel_id.get().to_string(),
            message.author.id.get().to_string(),
        )
        .with_username(message.author.name.clone())
        .with_message(message.content.clone())
        .with_meta("message_id", message.id.get().to_string());
        envelope.timestamp = *message.timestamp;
        if let Some(global_name) = &message.author.global_name {
            envelope.display_name = global_name.clone();
        }

        if !message.attachments.is_empty() {
            envelope.event_type = EventType::FileShare;
            let files: Vec<serde_json::Value> = message
                .attachments
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "filename": a.filename,
                        "url": a.url,
                        "size": a.size,
                    })
                })
                .collect();
            envelope = envelope.with_meta("attachments", serde_json::json!(files));
        }

        self.forward(envelope).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let envelope = match interaction {
            Interaction::Command(command) => {
                let server = command
                    .guild_id
                    .map(|g| g.get().to_string())
                    .unwrap_or_else(|| "dm".to_string());
                let args: Vec<String> = command
                    .data
                    .options
                    .iter()
                    .map(|o| format!("{}={:?}", o.name, o.value))
                    .collect();

                EventEnvelope::new(
                    EventType::ChatMessage,
                    Platform::Discord,
                    server,
                    command.channel_id.get().to_string(),
                    command.user.id.get().to_string(),
                )
                .with_username(command.user.name.clone())
                .with_message(format!("!{}", command.data.name))
                .with_meta("interaction", "slash_command")
                .with_meta("options", serde_json::json!(args))
            }
            Interaction::Component(component) => {
                // Acknowledge immediately to prevent "interaction failed" in
                // the client UI.
                if let Err(error) = component
                    .create_response(
                        &ctx.http,
                        serenity::all::CreateInteractionResponse::Defer(
                            serenity::all::CreateInteractionResponseMessage::new(),
                        ),
                    )
                    .await
                {
                    tracing::warn!(%error, "failed to acknowledge interaction");
                }

                let server = component
                    .guild_id
                    .map(|g| g.get().to_string())
                    .unwrap_or_else(|| "dm".to_string());
                let values = match &component.data.kind {
                    serenity::all::ComponentInteractionDataKind::StringSelect { values } => {
                        values.clone()
                    }
                    _ => Vec::new(),
                };
                let (custom_id, session_id) = split_custom_id(&component.data.custom_id);

                let mut envelope = EventEnvelope::new(
                    EventType::Reaction,
                    Platform::Discord,
                    server,
                    component.channel_id.get().to_string(),
                    component.user.id.get().to_string(),
                )
                .with_username(component.user.name.clone())
                .with_meta("interaction", "component")
                .with_meta("custom_id", custom_id)
                .with_meta("values", serde_json::json!(values))
                .with_meta("message_id", component.message.id.get().to_string());
                if let Some(session_id) = session_id {
                    envelope = envelope.with_meta("session_id", session_id);
                }
                envelope
            }
            Interaction::Modal(modal) => {
                let server = modal
                    .guild_id
                    .map(|g| g.get().to_string())
                    .unwrap_or_else(|| "dm".to_string());
                let (custom_id, session_id) = split_custom_id(&modal.data.custom_id);

                let mut envelope = EventEnvelope::new(
                    EventType::Reaction,
                    Platform::Discord,
                    server,
                    modal.channel_id.get().to_string(),
                    modal.user.id.get().to_string(),
                )
                .with_username(modal.user.name.clone())
                .with_meta("interaction", "modal")
                .with_meta("custom_id", custom_id);
                if let Some(session_id) = session_id {
                    envelope = envelope.with_meta("session_id", session_id);
                }
                envelope
            }
            _ => return,
        };

        self.forward(envelope).await;
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let envelope = EventEnvelope::new(
            EventType::MemberJoin,
            Platform::Discord,
            member.guild_id.get().to_string(),
            member.guild_id.get().to_string(),
            member.user.id.get().to_string(),
        )
        .with_username(member.user.name.clone());
        self.forward(envelope).await;
    }

    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member: Option<Member>,
    ) {
        let envelope = EventEnvelope::new(
            EventType::MemberLeave,
            Platform::Discord,
            guild_id.get().to_string(),
            guild_id.get().to_string(),
            user.id.get().to_string(),
        )
        .with_username(user.name.clone());
        self.forward(envelope).await;
    }

    async fn guild_ban_addition(&self, _ctx: Context, guild_id: GuildId, user: User) {
        let envelope = EventEnvelope::new(
            EventType::Ban,
            Platform::Discord,
            guild_id.get().to_string(),
            guild_id.get().to_string(),
            user.id.get().to_string(),
        )
        .with_username(user.name.clone());
        self.forward(envelope).await;
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let was_connected = old.as_ref().is_some_and(|o| o.channel_id.is_some());
        let is_connected = new.channel_id.is_some();
        let event_type = match (was_connected, is_connected) {
            (false, true) => EventType::VoiceJoin,
            (true, false) => EventType::VoiceLeave,
            _ => return,
        };

        let channel = new
            .channel_id
            .or(old.and_then(|o| o.channel_id))
            .map(|c| c.get().to_string())
            .unwrap_or_default();

        let envelope = EventEnvelope::new(
            event_type,
            Platform::Discord,
            guild_id.get().to_string(),
            channel,
            new.user_id.get().to_string(),
        );
        self.forward(envelope).await;
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        old: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        // A premium_since transition from none to some is a boost.
        let was_boosting = old.is_some_and(|m| m.premium_since.is_some());
        if was_boosting || event.premium_since.is_none() {
            return;
        }

        let envelope = EventEnvelope::new(
            EventType::Boost,
            Platform::Discord,
            event.guild_id.get().to_string(),
            event.guild_id.get().to_string(),
            event.user.id.get().to_string(),
        )
        .with_username(event.user.name.clone());
        self.forward(envelope).await;
    }
}

/// Component custom_ids carry `<id>::<session_id>` when the router minted
/// the component; split the hidden state back out.
fn split_custom_id(custom_id: &str) -> (String, Option<String>) {
    match custom_id.split_once("::") {
        Some((id, session)) if !session.is_empty() => {
            (id.to_string(), Some(session.to_string()))
        }
        _ => (custom_id.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_id_state_splits() {
        let (id, session) = split_custom_id("confirm_btn::sess_abc123");
        assert_eq!(id, "confirm_btn");
        assert_eq!(session.as_deref(), Some("sess_abc123"));

        let (id, session) = split_custom_id("plain_button");
        assert_eq!(id, "plain_button");
        assert!(session.is_none());

        let (id, session) = split_custom_id("trailing::");
        assert_eq!(id, "trailing::");
        assert!(session.is_none());
    }
}
