//! Pusher trait and the outbound request shapes.

use crate::error::Result;
use crate::{EntityId, Platform};

use async_trait::async_trait;

/// One outbound side-effect on a platform surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PushRequest {
    Chat {
        entity_id: EntityId,
        message: String,
    },
    Timeout {
        entity_id: EntityId,
        user_id: String,
        duration_minutes: u32,
        reason: String,
    },
    Ban {
        entity_id: EntityId,
        user_id: String,
        reason: String,
    },
    DeleteMessage {
        entity_id: EntityId,
        message_id: String,
    },
}

impl PushRequest {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            PushRequest::Chat { entity_id, .. }
            | PushRequest::Timeout { entity_id, .. }
            | PushRequest::Ban { entity_id, .. }
            | PushRequest::DeleteMessage { entity_id, .. } => entity_id,
        }
    }
}

/// A platform-specific pusher. Implementations own their API credentials
/// and rate handling; callers route by platform through the manager.
#[async_trait]
pub trait ActionPusher: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    async fn push(&self, request: &PushRequest) -> Result<()>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
