//! Routing table lookups: entity -> community and community -> gateways.
//!
//! Lookups are indexed queries behind TTL caches; nothing holds the
//! entity/community/gateway graph in memory as mutually-referencing objects.

use crate::db::Db;
use crate::error::Result;
use crate::{CommunityId, EntityId, Platform};

use moka::future::Cache;
use sqlx::Row as _;

/// An outbound binding used to fan responses out to a community's surfaces.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Gateway {
    pub id: String,
    pub community_id: CommunityId,
    pub platform: Platform,
    pub server_id: String,
    pub channel_id: String,
}

impl Gateway {
    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.platform, &self.server_id, &self.channel_id)
    }
}

/// One attachment a receiver should hold open.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub platform: Platform,
    pub entity_id: EntityId,
    pub server_id: String,
    pub channel_id: String,
    pub community_id: CommunityId,
}

pub struct RoutingTable {
    db: Db,
    entity_cache: Cache<String, Option<CommunityId>>,
}

impl RoutingTable {
    pub fn new(db: Db, entity_cache_ttl_secs: u64) -> Self {
        Self {
            db,
            entity_cache: crate::cache::entity_cache(entity_cache_ttl_secs),
        }
    }

    /// Resolve an entity to its community. Negative results are cached too so
    /// unrouted surfaces do not hammer the database.
    pub async fn community_of(&self, entity_id: &EntityId) -> Result<Option<CommunityId>> {
        let key = entity_id.to_string();
        if let Some(cached) = self.entity_cache.get(&key).await {
            crate::telemetry::Metrics::global()
                .cache_hits_total
                .with_label_values(&["entities"])
                .inc();
            return Ok(cached);
        }
        crate::telemetry::Metrics::global()
            .cache_misses_total
            .with_label_values(&["entities"])
            .inc();

        let row = sqlx::query(
            "SELECT community_id FROM entities WHERE entity_id = $1 AND is_active = $2",
        )
        .bind(&key)
        .bind(1i64)
        .fetch_optional(self.db.read())
        .await?;

        let community = row.map(|r| r.get::<i64, _>("community_id"));
        self.entity_cache.insert(key, community).await;
        Ok(community)
    }

    /// Active gateways for a community, in insertion order.
    pub async fn gateways(&self, community_id: CommunityId) -> Result<Vec<Gateway>> {
        let rows = sqlx::query(
            "SELECT id, community_id, platform, server_id, channel_id \
             FROM routing_gateways WHERE community_id = $1 AND is_active = $2",
        )
        .bind(community_id)
        .bind(1i64)
        .fetch_all(self.db.read())
        .await?;

        Ok(rows
            .iter()
            .map(|row| Gateway {
                id: row.get("id"),
                community_id: row.get("community_id"),
                platform: Platform::parse(&row.get::<String, _>("platform")),
                server_id: row.get("server_id"),
                channel_id: row.get("channel_id"),
            })
            .collect())
    }

    /// Every active attachment, grouped by nothing: receivers filter by
    /// their own platform.
    pub async fn attachments(&self) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT entity_id, platform, server_id, channel_id, community_id \
             FROM entities WHERE is_active = $1",
        )
        .bind(1i64)
        .fetch_all(self.db.read())
        .await?;

        Ok(rows
            .iter()
            .map(|row| Attachment {
                platform: Platform::parse(&row.get::<String, _>("platform")),
                entity_id: EntityId(row.get("entity_id")),
                server_id: row.get("server_id"),
                channel_id: row.get("channel_id"),
                community_id: row.get("community_id"),
            })
            .collect())
    }

    /// Register (or reactivate) an entity mapping.
    pub async fn upsert_entity(
        &self,
        entity_id: &EntityId,
        community_id: CommunityId,
    ) -> Result<()> {
        let (platform, server, channel) = entity_id
            .parts()
            .ok_or_else(|| crate::error::RouterError::Validation(format!(
                "bad entity id {entity_id}"
            )))?;

        sqlx::query(
            "INSERT INTO entities (entity_id, platform, server_id, channel_id, community_id, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (entity_id) DO UPDATE SET community_id = $7, is_active = $8",
        )
        .bind(entity_id.as_str())
        .bind(platform.as_str())
        .bind(server)
        .bind(channel)
        .bind(community_id)
        .bind(1i64)
        .bind(community_id)
        .bind(1i64)
        .execute(self.db.write())
        .await?;

        self.entity_cache.invalidate(entity_id.as_str()).await;
        Ok(())
    }

    /// Register a gateway binding.
    pub async fn upsert_gateway(&self, gateway: &Gateway) -> Result<()> {
        sqlx::query(
            "INSERT INTO routing_gateways (id, community_id, platform, server_id, channel_id, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET is_active = $7",
        )
        .bind(&gateway.id)
        .bind(gateway.community_id)
        .bind(gateway.platform.as_str())
        .bind(&gateway.server_id)
        .bind(&gateway.channel_id)
        .bind(1i64)
        .bind(1i64)
        .execute(self.db.write())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn entity_resolution_round_trips() {
        let table = RoutingTable::new(test_db().await, 600);
        let entity = EntityId::new(Platform::Twitch, "foo", "1");

        assert_eq!(table.community_of(&entity).await.unwrap(), None);

        table.upsert_entity(&entity, 42).await.unwrap();
        assert_eq!(table.community_of(&entity).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn gateways_fan_out_per_community() {
        let table = RoutingTable::new(test_db().await, 600);

        table
            .upsert_gateway(&Gateway {
                id: "gw-1".into(),
                community_id: 42,
                platform: Platform::Twitch,
                server_id: "foo".into(),
                channel_id: "1".into(),
            })
            .await
            .unwrap();
        table
            .upsert_gateway(&Gateway {
                id: "gw-2".into(),
                community_id: 42,
                platform: Platform::Discord,
                server_id: "guild".into(),
                channel_id: "chan".into(),
            })
            .await
            .unwrap();

        let gateways = table.gateways(42).await.unwrap();
        assert_eq!(gateways.len(), 2);
        assert_eq!(
            gateways[1].entity_id(),
            EntityId::new(Platform::Discord, "guild", "chan")
        );
        assert!(table.gateways(43).await.unwrap().is_empty());
    }
}
