//! Consumer-group worker loop.
//!
//! Each worker claims batches from one stream, processes entries concurrently
//! under a semaphore, acknowledges successes, retries transient failures via
//! the pending-entry claim timer, and dead-letters everything else.

use super::redis::RedisStreams;
use super::streams::StreamEntry;
use crate::config::StreamConfig;
use crate::error::ErrorKind;
use crate::telemetry::Metrics;
use crate::{EventEnvelope, audit};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

/// Processing logic plugged into a [`StreamConsumer`].
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: EventEnvelope) -> crate::Result<()>;
}

/// One consumer-group worker bound to a single stream.
pub struct StreamConsumer {
    streams: RedisStreams,
    stream: String,
    group: String,
    consumer: String,
    config: StreamConfig,
    handler: Arc<dyn StreamHandler>,
    semaphore: Arc<Semaphore>,
    /// Event ids already processed successfully by this worker. A replay hit
    /// is acked without re-invoking the handler.
    seen: moka::sync::Cache<String, ()>,
}

impl StreamConsumer {
    pub fn new(
        streams: RedisStreams,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        config: StreamConfig,
        concurrency: usize,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Self {
            streams,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            config,
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            seen: moka::sync::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(3_600))
                .build(),
        }
    }

    /// Run until `shutdown` flips to true. New entries stop being claimed
    /// immediately; in-flight work drains before return.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(error) = self.streams.ensure_group(&self.stream, &self.group).await {
            tracing::error!(%error, stream = %self.stream, "failed to create consumer group");
            return;
        }

        audit::system(&format!("stream consumer {} started", self.consumer));
        let mut polls: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reclaim stalled entries roughly once per claim-idle window.
            let polls_per_reclaim =
                (self.config.claim_idle_ms / self.config.block_ms.max(1)).max(1);
            if polls % polls_per_reclaim == 0 {
                self.reclaim_pass().await;
            }
            polls += 1;

            let entries = match self
                .streams
                .read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    self.config.block_ms,
                )
                .await
            {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(%error, stream = %self.stream, "stream read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            self.process_batch(entries).await;
        }

        // Every batch is awaited before the next poll, so nothing is in
        // flight once the loop exits.
        audit::system(&format!("stream consumer {} stopped", self.consumer));
    }

    /// Process one batch concurrently, bounded by the worker semaphore.
    async fn process_batch(&self, entries: Vec<StreamEntry>) {
        let joins = entries.into_iter().map(|entry| {
            let semaphore = self.semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("consumer semaphore never closed");
                self.process_entry(entry).await;
            }
        });
        futures::future::join_all(joins).await;
    }

    async fn process_entry(&self, entry: StreamEntry) {
        let metrics = Metrics::global();

        if !entry.event_id.is_empty() && self.seen.contains_key(&entry.event_id) {
            self.ack_entry(&entry, "duplicate").await;
            return;
        }

        let envelope = match entry.envelope() {
            Ok(envelope) => envelope,
            Err(reason) => {
                self.dead_letter(&entry, &format!("malformed payload: {reason}"))
                    .await;
                return;
            }
        };

        if let Err(reason) = envelope.validate() {
            self.dead_letter(&entry, &format!("invalid envelope: {reason}"))
                .await;
            return;
        }

        match self.handler.handle(envelope).await {
            Ok(()) => {
                self.seen.insert(entry.event_id.clone(), ());
                self.ack_entry(&entry, "acked").await;
            }
            Err(error) => {
                let kind = error.kind();
                if kind.is_retryable() {
                    if entry.retry_count() >= self.config.max_retries {
                        self.dead_letter(&entry, &format!("max retries exceeded: {error}"))
                            .await;
                    } else {
                        // Leave unacked; the claim timer redelivers.
                        tracing::warn!(
                            event_id = %entry.event_id,
                            retry = entry.retry_count(),
                            %error,
                            "transient failure, leaving entry pending"
                        );
                        metrics
                            .stream_entries_total
                            .with_label_values(&[&self.stream, "retried"])
                            .inc();
                    }
                } else if matches!(kind, ErrorKind::Validation | ErrorKind::Internal) {
                    self.dead_letter(&entry, &error.to_string()).await;
                } else {
                    // Terminal skip: NotFound, RateLimited, Auth/Authz.
                    tracing::debug!(event_id = %entry.event_id, %error, "terminal skip");
                    self.ack_entry(&entry, "skipped").await;
                }
            }
        }
    }

    /// Re-deliver entries stuck pending on a dead claimant. Entries past the
    /// retry budget go straight to the DLQ.
    async fn reclaim_pass(&self) {
        let claimed = match self
            .streams
            .claim_stale(
                &self.stream,
                &self.group,
                &self.consumer,
                self.config.claim_idle_ms,
                self.config.batch_size,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(error) => {
                tracing::debug!(%error, stream = %self.stream, "reclaim pass failed");
                return;
            }
        };

        let mut retryable = Vec::new();
        for entry in claimed {
            if entry.retry_count() > self.config.max_retries {
                self.dead_letter(&entry, "max retries exceeded: claim timeout")
                    .await;
            } else {
                retryable.push(entry);
            }
        }
        self.process_batch(retryable).await;
    }

    async fn ack_entry(&self, entry: &StreamEntry, outcome: &'static str) {
        if let Err(error) = self.streams.ack(&self.stream, &self.group, &entry.id).await {
            tracing::warn!(%error, id = %entry.id, "ack failed; entry will redeliver");
            return;
        }
        Metrics::global()
            .stream_entries_total
            .with_label_values(&[&self.stream, outcome])
            .inc();
    }

    /// Publish to the DLQ and then acknowledge so the primary stream holds
    /// no pending entry for this id. DLQ publish failure keeps the entry
    /// pending: it must land somewhere.
    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) {
        match self
            .streams
            .publish_dead_letter(&self.stream, entry, reason)
            .await
        {
            Ok(dlq) => {
                tracing::warn!(
                    event_id = %entry.event_id,
                    %dlq,
                    %reason,
                    "entry moved to dead-letter stream"
                );
                self.ack_entry(entry, "dlq").await;
                if let Ok(depth) = self.streams.stream_len(&dlq).await {
                    Metrics::global()
                        .dlq_depth
                        .with_label_values(&[&self.stream])
                        .set(depth as i64);
                }
            }
            Err(error) => {
                tracing::error!(%error, event_id = %entry.event_id, "dead-letter publish failed");
            }
        }
    }
}
