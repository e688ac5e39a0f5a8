//! Channel discovery: which surfaces each receiver should attach to.
//!
//! The directory holds a hot-swappable snapshot of the routing table's
//! attachments, refreshed periodically so dynamic joins and leaves take
//! effect without restarting receivers.

use crate::error::Result;
use crate::router::routing::{Attachment, RoutingTable};
use crate::{CommunityId, EntityId, Platform};

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct ChannelDirectory {
    routing: Arc<RoutingTable>,
    snapshot: ArcSwap<Vec<Attachment>>,
}

impl ChannelDirectory {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self {
            routing,
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Reload the snapshot from the routing table.
    pub async fn refresh(&self) -> Result<()> {
        let attachments = self.routing.attachments().await?;
        tracing::debug!(count = attachments.len(), "channel directory refreshed");
        self.snapshot.store(Arc::new(attachments));
        Ok(())
    }

    /// Attachments for one platform.
    pub fn for_platform(&self, platform: Platform) -> Vec<Attachment> {
        self.snapshot
            .load()
            .iter()
            .filter(|a| a.platform == platform)
            .cloned()
            .collect()
    }

    /// Community owning an entity, from the snapshot (no database hit).
    pub fn community_of(&self, entity_id: &EntityId) -> Option<CommunityId> {
        self.snapshot
            .load()
            .iter()
            .find(|a| &a.entity_id == entity_id)
            .map(|a| a.community_id)
    }

    /// Periodic refresh until shutdown.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.refresh().await {
                        tracing::warn!(%error, "channel discovery refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn snapshot_filters_by_platform() {
        let routing = Arc::new(RoutingTable::new(test_db().await, 600));
        routing
            .upsert_entity(&EntityId::new(Platform::Twitch, "foo", "1"), 1)
            .await
            .unwrap();
        routing
            .upsert_entity(&EntityId::new(Platform::Kick, "bar", "2"), 2)
            .await
            .unwrap();

        let directory = ChannelDirectory::new(routing);
        assert!(directory.for_platform(Platform::Twitch).is_empty());

        directory.refresh().await.unwrap();
        let twitch = directory.for_platform(Platform::Twitch);
        assert_eq!(twitch.len(), 1);
        assert_eq!(twitch[0].community_id, 1);
        assert_eq!(
            directory.community_of(&EntityId::new(Platform::Kick, "bar", "2")),
            Some(2)
        );
    }
}
