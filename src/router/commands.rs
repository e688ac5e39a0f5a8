//! Command records: parsing, storage, and the cached lookup table.

use crate::db::Db;
use crate::error::Result;
use crate::{CommunityId, EventType};

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::sync::Arc;

/// How the router reaches the module behind a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Container,
    Rest,
    Grpc,
    Lambda,
    GcpFunction,
    Openwhisk,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Container => "container",
            Transport::Rest => "rest",
            Transport::Grpc => "grpc",
            Transport::Lambda => "lambda",
            Transport::GcpFunction => "gcp_function",
            Transport::Openwhisk => "openwhisk",
        }
    }

    pub fn parse(value: &str) -> Transport {
        match value {
            "rest" => Transport::Rest,
            "grpc" => Transport::Grpc,
            "lambda" => Transport::Lambda,
            "gcp_function" => Transport::GcpFunction,
            "openwhisk" => Transport::Openwhisk,
            _ => Transport::Container,
        }
    }
}

/// Whether a record fires on explicit commands or on event types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Command,
    Event,
}

/// One routable command definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub command: String,
    pub prefix: String,
    pub description: String,
    pub location_url: String,
    pub transport: Transport,
    pub method: String,
    pub timeout_ms: u64,
    pub auth_required: bool,
    pub rate_limit_per_minute: u32,
    pub priority: i32,
    pub module_id: String,
    pub trigger_type: TriggerType,
    /// Event names this record fires on when `trigger_type == Event`.
    pub event_types: Vec<String>,
    /// None = visible to every community.
    pub community_id: Option<CommunityId>,
    pub is_active: bool,
    pub version: i32,
}

impl CommandRecord {
    /// Retries are only safe when replaying the dispatch cannot double a
    /// side-effect.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "PUT" | "DELETE")
    }

    pub fn fires_on(&self, event_type: EventType) -> bool {
        self.trigger_type == TriggerType::Event
            && self.event_types.iter().any(|t| t == event_type.as_str())
    }
}

/// A tokenized command line: `!help me now` -> ("!", "help", "me now").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub prefix: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Tokenize a message if it starts with a configured prefix. Commands are
/// lowercased; arguments keep their original form.
pub fn parse_command(message: &str, prefixes: &[char]) -> Option<ParsedCommand> {
    let trimmed = message.trim_start();
    let first = trimmed.chars().next()?;
    if !prefixes.contains(&first) {
        return None;
    }

    let rest = &trimmed[first.len_utf8()..];
    let mut words = rest.split_whitespace();
    let command = words.next()?;
    if command.is_empty() {
        return None;
    }

    Some(ParsedCommand {
        prefix: first.to_string(),
        command: command.to_lowercase(),
        args: words.map(str::to_string).collect(),
    })
}

/// Command table access with a short-TTL cache in front of the database.
pub struct CommandStore {
    db: Db,
    cache: Cache<(String, String), Arc<Vec<CommandRecord>>>,
}

impl CommandStore {
    pub fn new(db: Db, cache_ttl_secs: u64) -> Self {
        Self {
            db,
            cache: crate::cache::command_cache(cache_ttl_secs),
        }
    }

    /// Active records matching `(prefix, command)`, most specific first:
    /// community-scoped rows before global rows, then by priority.
    pub async fn lookup(
        &self,
        prefix: &str,
        command: &str,
        community_id: Option<CommunityId>,
    ) -> Result<Vec<CommandRecord>> {
        let key = (prefix.to_string(), command.to_string());
        let records = match self.cache.get(&key).await {
            Some(records) => {
                crate::telemetry::Metrics::global()
                    .cache_hits_total
                    .with_label_values(&["commands"])
                    .inc();
                records
            }
            None => {
                crate::telemetry::Metrics::global()
                    .cache_misses_total
                    .with_label_values(&["commands"])
                    .inc();
                let rows = sqlx::query(
                    "SELECT * FROM commands WHERE prefix = $1 AND command = $2 AND is_active = $3",
                )
                .bind(prefix)
                .bind(command)
                .bind(1i64)
                .fetch_all(self.db.read())
                .await?;

                let records: Arc<Vec<CommandRecord>> =
                    Arc::new(rows.iter().map(record_from_row).collect());
                self.cache.insert(key, records.clone()).await;
                records
            }
        };

        let mut visible: Vec<CommandRecord> = records
            .iter()
            .filter(|r| r.community_id.is_none() || r.community_id == community_id)
            .cloned()
            .collect();
        visible.sort_by_key(|r| (r.community_id.is_none(), -r.priority));
        Ok(visible)
    }

    /// Active event-triggered records for an event type.
    pub async fn event_triggers(
        &self,
        event_type: EventType,
        community_id: Option<CommunityId>,
    ) -> Result<Vec<CommandRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM commands WHERE trigger_type = $1 AND is_active = $2",
        )
        .bind("event")
        .bind(1i64)
        .fetch_all(self.db.read())
        .await?;

        Ok(rows
            .iter()
            .map(record_from_row)
            .filter(|r| r.fires_on(event_type))
            .filter(|r| r.community_id.is_none() || r.community_id == community_id)
            .collect())
    }

    /// Every active record (the `GET /commands` surface).
    pub async fn list_active(&self) -> Result<Vec<CommandRecord>> {
        let rows = sqlx::query("SELECT * FROM commands WHERE is_active = $1")
            .bind(1i64)
            .fetch_all(self.db.read())
            .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// Insert or replace a record (operator tooling and tests).
    pub async fn upsert(&self, record: &CommandRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO commands \
             (id, command, prefix, description, location_url, transport, method, timeout_ms, \
              auth_required, rate_limit_per_minute, priority, module_id, trigger_type, \
              event_types, community_id, is_active, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (id) DO UPDATE SET \
             command = $18, prefix = $19, description = $20, location_url = $21, transport = $22, \
             method = $23, timeout_ms = $24, auth_required = $25, rate_limit_per_minute = $26, \
             priority = $27, module_id = $28, trigger_type = $29, event_types = $30, \
             community_id = $31, is_active = $32, version = $33",
        )
        .bind(&record.id)
        .bind(&record.command)
        .bind(&record.prefix)
        .bind(&record.description)
        .bind(&record.location_url)
        .bind(record.transport.as_str())
        .bind(&record.method)
        .bind(record.timeout_ms as i64)
        .bind(record.auth_required as i64)
        .bind(record.rate_limit_per_minute as i64)
        .bind(record.priority as i64)
        .bind(&record.module_id)
        .bind(match record.trigger_type {
            TriggerType::Command => "command",
            TriggerType::Event => "event",
        })
        .bind(record.event_types.join(","))
        .bind(record.community_id)
        .bind(record.is_active as i64)
        .bind(record.version as i64)
        .bind(&record.command)
        .bind(&record.prefix)
        .bind(&record.description)
        .bind(&record.location_url)
        .bind(record.transport.as_str())
        .bind(&record.method)
        .bind(record.timeout_ms as i64)
        .bind(record.auth_required as i64)
        .bind(record.rate_limit_per_minute as i64)
        .bind(record.priority as i64)
        .bind(&record.module_id)
        .bind(match record.trigger_type {
            TriggerType::Command => "command",
            TriggerType::Event => "event",
        })
        .bind(record.event_types.join(","))
        .bind(record.community_id)
        .bind(record.is_active as i64)
        .bind(record.version as i64)
        .execute(self.db.write())
        .await?;

        self.cache
            .invalidate(&(record.prefix.clone(), record.command.clone()))
            .await;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::any::AnyRow) -> CommandRecord {
    let event_types: String = row.get("event_types");
    CommandRecord {
        id: row.get("id"),
        command: row.get("command"),
        prefix: row.get("prefix"),
        description: row.get("description"),
        location_url: row.get("location_url"),
        transport: Transport::parse(&row.get::<String, _>("transport")),
        method: row.get("method"),
        timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
        auth_required: row.get::<i64, _>("auth_required") != 0,
        rate_limit_per_minute: row.get::<i64, _>("rate_limit_per_minute") as u32,
        priority: row.get::<i64, _>("priority") as i32,
        module_id: row.get("module_id"),
        trigger_type: match row.get::<String, _>("trigger_type").as_str() {
            "event" => TriggerType::Event,
            _ => TriggerType::Command,
        },
        event_types: event_types
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        community_id: row.try_get::<i64, _>("community_id").ok(),
        is_active: row.get::<i64, _>("is_active") != 0,
        version: row.get::<i64, _>("version") as i32,
    }
}

#[cfg(test)]
pub(crate) fn test_record(command: &str, location_url: &str) -> CommandRecord {
    CommandRecord {
        id: format!("cmd-{command}"),
        command: command.to_string(),
        prefix: "!".to_string(),
        description: String::new(),
        location_url: location_url.to_string(),
        transport: Transport::Container,
        method: "POST".to_string(),
        timeout_ms: 30_000,
        auth_required: false,
        rate_limit_per_minute: 60,
        priority: 0,
        module_id: format!("module-{command}"),
        trigger_type: TriggerType::Command,
        event_types: Vec::new(),
        community_id: None,
        is_active: true,
        version: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn parses_bang_commands() {
        let parsed = parse_command("!help me now", &['!', '#']).unwrap();
        assert_eq!(parsed.prefix, "!");
        assert_eq!(parsed.command, "help");
        assert_eq!(parsed.args, vec!["me", "now"]);
    }

    #[test]
    fn parses_hash_commands_and_lowercases() {
        let parsed = parse_command("#Quote add \"stay a while\"", &['!', '#']).unwrap();
        assert_eq!(parsed.prefix, "#");
        assert_eq!(parsed.command, "quote");
        assert_eq!(parsed.args[0], "add");
    }

    #[test]
    fn plain_chat_is_not_a_command() {
        assert!(parse_command("hello there", &['!', '#']).is_none());
        assert!(parse_command("", &['!', '#']).is_none());
        assert!(parse_command("!", &['!', '#']).is_none());
        assert!(parse_command("   ", &['!', '#']).is_none());
    }

    #[tokio::test]
    async fn lookup_prefers_community_rows() {
        let db = test_db().await;
        let store = CommandStore::new(db, 60);

        let global = test_record("help", "http://global/help");
        store.upsert(&global).await.unwrap();

        let mut scoped = test_record("help", "http://scoped/help");
        scoped.id = "cmd-help-scoped".into();
        scoped.community_id = Some(7);
        store.upsert(&scoped).await.unwrap();

        let records = store.lookup("!", "help", Some(7)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].location_url, "http://scoped/help");

        let records = store.lookup("!", "help", Some(8)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location_url, "http://global/help");
    }

    #[tokio::test]
    async fn event_triggers_filter_on_event_type() {
        let db = test_db().await;
        let store = CommandStore::new(db, 60);

        let mut record = test_record("onfollow", "http://mod/follow");
        record.trigger_type = TriggerType::Event;
        record.event_types = vec!["follow".into(), "subscription".into()];
        store.upsert(&record).await.unwrap();

        let hits = store
            .event_triggers(EventType::Follow, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = store.event_triggers(EventType::Raid, None).await.unwrap();
        assert!(misses.is_empty());
    }
}
