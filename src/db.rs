//! Database handles and schema bootstrap.
//!
//! The same code runs against Postgres (`DATABASE_URL`) in production and
//! in-memory SQLite in tests, so all SQL stays portable and the schema is
//! created with idempotent DDL at startup. Reputation writes always go to the
//! primary; read paths may use the replica pool when one is configured.

use crate::config::DatabaseConfig;
use crate::error::Result;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use std::sync::Once;

static INSTALL_DRIVERS: Once = Once::new();

/// Shared database handle: primary pool plus optional read replica.
#[derive(Clone)]
pub struct Db {
    primary: AnyPool,
    replica: Option<AnyPool>,
}

impl Db {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let primary = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await?;

        let replica = match &config.read_replica_url {
            Some(url) => Some(
                AnyPoolOptions::new()
                    .max_connections(config.pool_size)
                    .connect(url)
                    .await?,
            ),
            None => None,
        };

        Ok(Self { primary, replica })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: AnyPool) -> Self {
        Self {
            primary: pool,
            replica: None,
        }
    }

    /// Pool for writes.
    pub fn write(&self) -> &AnyPool {
        &self.primary
    }

    /// Pool for reads; the replica when configured.
    pub fn read(&self) -> &AnyPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.primary).await?;
        Ok(())
    }

    /// Create all tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.primary).await?;
        }
        Ok(())
    }
}

/// Portable DDL: TEXT primary keys generated in Rust, RFC 3339 TEXT
/// timestamps, REAL scores.
const SCHEMA: &[&str] = &[
    // Operator-managed routing metadata: one row per routable surface.
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        entity_id    TEXT PRIMARY KEY,
        platform     TEXT NOT NULL,
        server_id    TEXT NOT NULL,
        channel_id   TEXT NOT NULL,
        community_id BIGINT NOT NULL,
        is_active    INTEGER NOT NULL DEFAULT 1
    )
    "#,
    // Outbound fan-out bindings per community.
    r#"
    CREATE TABLE IF NOT EXISTS routing_gateways (
        id           TEXT PRIMARY KEY,
        community_id BIGINT NOT NULL,
        platform     TEXT NOT NULL,
        server_id    TEXT NOT NULL,
        channel_id   TEXT NOT NULL,
        is_active    INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_routing_gateways_community
        ON routing_gateways (community_id)
    "#,
    // Command records the router dispatches against.
    r#"
    CREATE TABLE IF NOT EXISTS commands (
        id                    TEXT PRIMARY KEY,
        command               TEXT NOT NULL,
        prefix                TEXT NOT NULL,
        description           TEXT NOT NULL DEFAULT '',
        location_url          TEXT NOT NULL,
        transport             TEXT NOT NULL,
        method                TEXT NOT NULL DEFAULT 'POST',
        timeout_ms            BIGINT NOT NULL DEFAULT 30000,
        auth_required         INTEGER NOT NULL DEFAULT 0,
        rate_limit_per_minute INTEGER NOT NULL DEFAULT 60,
        priority              INTEGER NOT NULL DEFAULT 0,
        module_id             TEXT NOT NULL DEFAULT '',
        trigger_type          TEXT NOT NULL DEFAULT 'command',
        event_types           TEXT NOT NULL DEFAULT '',
        community_id          BIGINT,
        is_active             INTEGER NOT NULL DEFAULT 1,
        version               INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_commands_lookup
        ON commands (prefix, command, is_active)
    "#,
    // One row per (community, user) score.
    r#"
    CREATE TABLE IF NOT EXISTS reputation (
        community_id  BIGINT NOT NULL,
        user_id       TEXT NOT NULL,
        score         DOUBLE PRECISION NOT NULL,
        total_events  BIGINT NOT NULL DEFAULT 0,
        banned        INTEGER NOT NULL DEFAULT 0,
        last_activity TEXT NOT NULL,
        PRIMARY KEY (community_id, user_id)
    )
    "#,
    // Append-only reputation event log; the unique key is the idempotency guard.
    r#"
    CREATE TABLE IF NOT EXISTS events (
        community_id BIGINT NOT NULL,
        event_id     TEXT NOT NULL,
        user_id      TEXT NOT NULL,
        entity_id    TEXT NOT NULL DEFAULT '',
        event_name   TEXT NOT NULL,
        event_score  DOUBLE PRECISION NOT NULL,
        event_data   TEXT NOT NULL DEFAULT '{}',
        processed_at TEXT NOT NULL,
        PRIMARY KEY (community_id, event_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_user
        ON events (community_id, user_id)
    "#,
    // Per-community weight overrides; defaults apply when no row exists.
    r#"
    CREATE TABLE IF NOT EXISTS weights (
        community_id BIGINT NOT NULL,
        event_name   TEXT NOT NULL,
        weight       DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (community_id, event_name)
    )
    "#,
    // Twitch OAuth tokens with refresh state.
    r#"
    CREATE TABLE IF NOT EXISTS twitch_tokens (
        broadcaster_id TEXT PRIMARY KEY,
        access_token   TEXT NOT NULL,
        refresh_token  TEXT NOT NULL,
        expires_at     TEXT NOT NULL,
        scopes         TEXT NOT NULL DEFAULT '',
        last_refreshed TEXT NOT NULL
    )
    "#,
];

/// Format a timestamp the way every table stores it.
pub fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
pub(crate) async fn test_db() -> Db {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");
    let db = Db::from_pool(pool);
    db.init_schema().await.expect("schema should apply");
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_twice() {
        let db = test_db().await;
        db.init_schema().await.expect("idempotent DDL");
    }

    #[test]
    fn timestamp_round_trip() {
        let now = chrono::Utc::now();
        let parsed = parse_ts(&format_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
