//! Redis Streams substrate.
//!
//! - `XADD` for publishing (with approximate MAXLEN trimming)
//! - `XREADGROUP` for consuming (consumer groups, one claimant per entry)
//! - `XACK` for acknowledgment
//! - `XPENDING` + `XCLAIM` for recovery of entries stuck on dead workers

use super::streams::{DeadLetter, StreamEntry, dlq_stream};
use crate::error::{PipelineError, Result};

use deadpool_redis::redis::{RedisResult, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;

/// Approximate per-stream retention.
const STREAM_MAXLEN: u64 = 100_000;

/// Shared Redis handle for streams, sessions, and rate-limit counters.
#[derive(Clone)]
pub struct RedisStreams {
    pool: Pool,
}

/// Consumer-group statistics for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub length: u64,
    pub pending: u64,
    pub consumers: u64,
    pub oldest_pending_ms: Option<u64>,
}

impl RedisStreams {
    /// Create a pool and validate the connection with a PING.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let mut config = Config::from_url(redis_url);
        config.pool = Some(deadpool_redis::PoolConfig {
            max_size: 32,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| PipelineError::Connection(format!("failed to create redis pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| PipelineError::Connection(format!("failed to get redis connection: {e}")))?;

        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| PipelineError::Connection(format!("redis PING failed: {e}")))?;

        Ok(Self { pool })
    }

    /// The underlying pool, shared with the rate limiter and session store.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    /// Append an envelope to a stream. Returns the substrate entry id.
    pub async fn publish(&self, stream: &str, event_id: &str, payload: &str) -> Result<String> {
        let mut conn = self.pool.get().await?;

        let id: String = deadpool_redis::redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("event_id")
            .arg(event_id)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::Publish(format!("XADD {stream}: {e}")))?;

        Ok(id)
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;

        // Start from 0 so entries published before the group was created are
        // still consumed; MKSTREAM creates the stream on first use.
        let result: RedisResult<String> = deadpool_redis::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(PipelineError::ConsumerGroup {
                stream: stream.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Claim up to `count` new entries for this consumer, blocking up to
    /// `block_ms` when the stream is idle.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.pool.get().await?;

        let result: RedisResult<RedisValue> = deadpool_redis::redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(RedisValue::Nil) => Ok(Vec::new()),
            Ok(value) => Ok(parse_xreadgroup_response(value)),
            Err(e) if e.to_string().contains("NOGROUP") => {
                // Stream key was recreated under us; restore the group and
                // let the next poll pick entries up.
                self.ensure_group(stream, group).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acknowledge one processed entry.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = deadpool_redis::redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Reclaim entries whose claimant went quiet.
    ///
    /// Returns the re-delivered entries with their updated delivery counts so
    /// the caller can decide between another attempt and the DLQ.
    pub async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.pool.get().await?;

        let pending: RedisValue = deadpool_redis::redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Entries: [id, consumer, idle_time, delivery_count]
        let mut stale: Vec<(String, u64)> = Vec::new();
        if let RedisValue::Array(entries) = pending {
            for entry in entries {
                let RedisValue::Array(parts) = entry else {
                    continue;
                };
                if parts.len() < 4 {
                    continue;
                }
                let (RedisValue::BulkString(id_bytes), RedisValue::Int(idle), RedisValue::Int(delivered)) =
                    (&parts[0], &parts[2], &parts[3])
                else {
                    continue;
                };
                if *idle as u64 >= min_idle_ms
                    && let Ok(id) = String::from_utf8(id_bytes.clone())
                {
                    stale.push((id, *delivered as u64));
                }
            }
        }

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = deadpool_redis::redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for (id, _) in &stale {
            cmd.arg(id);
        }

        let claimed: RedisValue = cmd.query_async(&mut conn).await?;

        let mut entries = parse_entry_list(claimed);
        // XCLAIM increments the delivery counter; reflect that on top of the
        // XPENDING numbers we read before claiming.
        for entry in &mut entries {
            if let Some((_, delivered)) = stale.iter().find(|(id, _)| *id == entry.id) {
                entry.delivery_count = delivered + 1;
            }
        }

        Ok(entries)
    }

    /// Publish a dead letter for `entry` and return the DLQ stream name.
    pub async fn publish_dead_letter(
        &self,
        primary_stream: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<String> {
        let dlq = dlq_stream(primary_stream);
        let letter = DeadLetter::from_entry(entry, primary_stream, reason);
        let payload = serde_json::to_string(&letter)
            .map_err(|e| PipelineError::Publish(format!("dead letter encode: {e}")))?;
        self.publish(&dlq, &entry.event_id, &payload).await?;
        Ok(dlq)
    }

    /// Current length of a stream (used for DLQ depth gauges).
    pub async fn stream_len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let length: u64 = deadpool_redis::redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }

    /// Consumer-group statistics.
    pub async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats> {
        let mut conn = self.pool.get().await?;

        let length: u64 = deadpool_redis::redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .unwrap_or(0);

        let pending_info: RedisValue = deadpool_redis::redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .unwrap_or(RedisValue::Nil);

        let mut stats = StreamStats {
            length,
            ..Default::default()
        };

        // [pending_count, smallest_id, largest_id, [[consumer, count], ...]]
        if let RedisValue::Array(parts) = pending_info
            && parts.len() >= 4
        {
            if let RedisValue::Int(p) = &parts[0] {
                stats.pending = *p as u64;
            }
            if let RedisValue::Array(consumers) = &parts[3] {
                stats.consumers = consumers.len() as u64;
            }
        }

        if stats.pending > 0 {
            let detail: RedisValue = deadpool_redis::redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg("-")
                .arg("+")
                .arg(1)
                .query_async(&mut conn)
                .await
                .unwrap_or(RedisValue::Nil);

            if let RedisValue::Array(entries) = detail
                && let Some(RedisValue::Array(parts)) = entries.first()
                && parts.len() >= 3
                && let RedisValue::Int(idle) = &parts[2]
            {
                stats.oldest_pending_ms = Some(*idle as u64);
            }
        }

        Ok(stats)
    }
}

/// Parse an XREADGROUP response:
/// `[[stream_name, [[id, [field, value, ...]], ...]]]`.
fn parse_xreadgroup_response(value: RedisValue) -> Vec<StreamEntry> {
    let RedisValue::Array(streams) = value else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for stream_data in streams {
        let RedisValue::Array(parts) = stream_data else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        if let RedisValue::Array(_) = &parts[1] {
            entries.extend(parse_entry_list(parts[1].clone()));
        }
    }
    entries
}

/// Parse a `[[id, [field, value, ...]], ...]` entry list (XREADGROUP inner
/// list and XCLAIM response share this shape).
fn parse_entry_list(value: RedisValue) -> Vec<StreamEntry> {
    let RedisValue::Array(list) = value else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for msg in list {
        let RedisValue::Array(msg_parts) = msg else {
            continue;
        };
        if msg_parts.len() < 2 {
            continue;
        }
        let (RedisValue::BulkString(id_bytes), RedisValue::Array(fields)) =
            (&msg_parts[0], &msg_parts[1])
        else {
            continue;
        };
        let Ok(id) = String::from_utf8(id_bytes.clone()) else {
            continue;
        };

        let mut event_id = String::new();
        let mut payload = String::new();
        let mut iter = fields.iter();
        while let Some(field) = iter.next() {
            let RedisValue::BulkString(name) = field else {
                continue;
            };
            let value = iter.next();
            let Some(RedisValue::BulkString(bytes)) = value else {
                continue;
            };
            match name.as_slice() {
                b"event_id" => event_id = String::from_utf8_lossy(bytes).into_owned(),
                b"payload" => payload = String::from_utf8_lossy(bytes).into_owned(),
                _ => {}
            }
        }

        entries.push(StreamEntry {
            id,
            event_id,
            payload,
            delivery_count: 1,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RedisValue {
        RedisValue::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_xreadgroup_shape() {
        let value = RedisValue::Array(vec![RedisValue::Array(vec![
            bulk("events:inbound"),
            RedisValue::Array(vec![RedisValue::Array(vec![
                bulk("1690000000-0"),
                RedisValue::Array(vec![
                    bulk("event_id"),
                    bulk("evt-1"),
                    bulk("payload"),
                    bulk("{\"k\":1}"),
                ]),
            ])]),
        ])]);

        let entries = parse_xreadgroup_response(value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1690000000-0");
        assert_eq!(entries[0].event_id, "evt-1");
        assert_eq!(entries[0].payload, "{\"k\":1}");
    }

    #[test]
    fn tolerates_unknown_fields_and_odd_shapes() {
        let value = RedisValue::Array(vec![RedisValue::Array(vec![
            bulk("events:inbound"),
            RedisValue::Array(vec![
                RedisValue::Array(vec![
                    bulk("1-0"),
                    RedisValue::Array(vec![bulk("extra"), bulk("x"), bulk("payload"), bulk("{}")]),
                ]),
                RedisValue::Int(42),
            ]),
        ])]);

        let entries = parse_xreadgroup_response(value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "{}");
        assert!(entries[0].event_id.is_empty());
    }

    #[test]
    fn nil_yields_no_entries() {
        assert!(parse_xreadgroup_response(RedisValue::Nil).is_empty());
    }
}
