//! ActionManager: registry and routing for all pushers.

use crate::actions::traits::{ActionPusher, PushRequest};
use crate::error::{Result, RouterError};
use crate::pipeline::StreamHandler;
use crate::reputation::engine::{ModerationAction, ModerationRequest, ModerationSink};
use crate::{EntityId, EventEnvelope, Platform};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds one pusher per platform and routes requests to it.
#[derive(Default)]
pub struct ActionManager {
    pushers: HashMap<Platform, Arc<dyn ActionPusher>>,
}

impl ActionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pusher: impl ActionPusher) {
        self.pushers.insert(pusher.platform(), Arc::new(pusher));
    }

    pub fn has_platform(&self, platform: Platform) -> bool {
        self.pushers.contains_key(&platform)
    }

    /// Route a request to its platform's pusher.
    pub async fn send(&self, request: &PushRequest) -> Result<()> {
        let platform = request
            .entity_id()
            .parts()
            .map(|(platform, _, _)| platform)
            .unwrap_or(Platform::Unknown);

        let Some(pusher) = self.pushers.get(&platform) else {
            return Err(RouterError::DispatchFailed {
                target: request.entity_id().to_string(),
                reason: format!("no action pusher registered for {platform}"),
            }
            .into());
        };
        pusher.push(request).await
    }
}

#[async_trait]
impl ModerationSink for ActionManager {
    async fn request_moderation(&self, request: ModerationRequest) -> Result<()> {
        let entity_id = EntityId(request.entity_id.clone());
        let push = match request.action {
            ModerationAction::Ban => PushRequest::Ban {
                entity_id,
                user_id: request.user_id,
                reason: request.reason,
            },
            ModerationAction::Timeout(minutes) => PushRequest::Timeout {
                entity_id,
                user_id: request.user_id,
                duration_minutes: minutes,
                reason: request.reason,
            },
        };
        self.send(&push).await
    }
}

/// `events:actions` consumer: envelopes marked `action=send_chat` become
/// chat pushes to their entity.
#[async_trait]
impl StreamHandler for ActionManager {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        match envelope.metadata.get("action").and_then(|v| v.as_str()) {
            Some("send_chat") => {
                self.send(&PushRequest::Chat {
                    entity_id: envelope.entity_id.clone(),
                    message: envelope.message.clone(),
                })
                .await
            }
            other => {
                tracing::debug!(action = ?other, event_id = %envelope.event_id, "unhandled action entry");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakePusher {
        platform: Platform,
        sent: Arc<Mutex<Vec<PushRequest>>>,
    }

    #[async_trait]
    impl ActionPusher for FakePusher {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn push(&self, request: &PushRequest) -> Result<()> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn requests_route_by_entity_platform() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ActionManager::new();
        manager.register(FakePusher {
            platform: Platform::Twitch,
            sent: sent.clone(),
        });

        manager
            .send(&PushRequest::Chat {
                entity_id: EntityId::new(Platform::Twitch, "foo", "1"),
                message: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);

        let error = manager
            .send(&PushRequest::Chat {
                entity_id: EntityId::new(Platform::Discord, "g", "c"),
                message: "hello".into(),
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no action pusher"));
    }

    #[tokio::test]
    async fn moderation_requests_become_pushes() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ActionManager::new();
        manager.register(FakePusher {
            platform: Platform::Twitch,
            sent: sent.clone(),
        });

        manager
            .request_moderation(ModerationRequest {
                platform: Platform::Twitch,
                entity_id: "twitch:foo:1".into(),
                community_id: 1,
                user_id: "u1".into(),
                action: ModerationAction::Timeout(60),
                reason: "escalation".into(),
            })
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert!(matches!(
            &sent[0],
            PushRequest::Timeout {
                duration_minutes: 60,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn action_stream_entries_route_chat() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ActionManager::new();
        manager.register(FakePusher {
            platform: Platform::Twitch,
            sent: sent.clone(),
        });

        let envelope = EventEnvelope::new(
            crate::EventType::ChatMessage,
            Platform::Twitch,
            "foo",
            "1",
            "router",
        )
        .with_message("usage: !help")
        .with_meta("action", "send_chat");

        manager.handle(envelope).await.unwrap();
        assert!(matches!(&sent.lock().unwrap()[0], PushRequest::Chat { message, .. } if message == "usage: !help"));
    }
}
