//! Global metrics registry and metric handle definitions.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use std::sync::LazyLock;

/// Global metrics instance. Initialized once, accessed from any call site.
static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for a WaddleBot process.
///
/// Access via `Metrics::global()`. Metric handles are cheap to clone (Arc
/// internally) so call sites can grab references without threading state.
pub struct Metrics {
    pub(crate) registry: Registry,

    // -- Ingest --
    /// Events accepted from receivers.
    /// Labels: platform, event_type.
    pub events_ingested_total: IntCounterVec,

    /// Webhook deliveries rejected before producing side-effects.
    /// Labels: platform, reason.
    pub webhook_rejections_total: IntCounterVec,

    // -- Router --
    /// Command executions by terminal state.
    /// Labels: state (completed/failed/rejected/rate_limited/unauthorized/timed_out).
    pub router_executions_total: IntCounterVec,

    /// End-to-end processing duration for one inbound event.
    pub event_processing_duration_seconds: Histogram,

    /// Dispatch duration per transport.
    pub dispatch_duration_seconds: HistogramVec,

    /// Dispatches currently in flight across all workers.
    pub in_flight_dispatches: IntGauge,

    /// Rate-limit rejections per namespace.
    pub rate_limited_total: IntCounterVec,

    // -- Stream pipeline --
    /// Entries read from primary streams by outcome (acked/retried/dlq).
    /// Labels: stream, outcome.
    pub stream_entries_total: IntCounterVec,

    /// Current pending-entry count per stream consumer group.
    pub stream_pending: IntGaugeVec,

    /// Dead-letter stream depth.
    pub dlq_depth: IntGaugeVec,

    // -- Reputation --
    /// Reputation events by result (applied/duplicate/failed).
    pub reputation_events_total: IntCounterVec,

    /// Policy enforcement actions (auto_ban/escalation).
    pub reputation_policy_actions_total: IntCounterVec,

    // -- Caches --
    /// Cache hits per cache name.
    pub cache_hits_total: IntCounterVec,

    /// Cache misses per cache name.
    pub cache_misses_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let events_ingested_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_events_ingested_total",
                "Events accepted from receivers",
            ),
            &["platform", "event_type"],
        )
        .expect("hardcoded metric descriptor");

        let webhook_rejections_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_webhook_rejections_total",
                "Webhook deliveries rejected",
            ),
            &["platform", "reason"],
        )
        .expect("hardcoded metric descriptor");

        let router_executions_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_router_executions_total",
                "Command executions by terminal state",
            ),
            &["state"],
        )
        .expect("hardcoded metric descriptor");

        let event_processing_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "waddlebot_event_processing_duration_seconds",
                "End-to-end processing duration for one inbound event",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("hardcoded metric descriptor");

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "waddlebot_dispatch_duration_seconds",
                "Dispatch duration per transport",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["transport"],
        )
        .expect("hardcoded metric descriptor");

        let in_flight_dispatches = IntGauge::new(
            "waddlebot_in_flight_dispatches",
            "Dispatches currently in flight",
        )
        .expect("hardcoded metric descriptor");

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_rate_limited_total",
                "Rate-limit rejections per namespace",
            ),
            &["namespace"],
        )
        .expect("hardcoded metric descriptor");

        let stream_entries_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_stream_entries_total",
                "Stream entries read, by outcome",
            ),
            &["stream", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        let stream_pending = IntGaugeVec::new(
            Opts::new(
                "waddlebot_stream_pending",
                "Pending entries per consumer group",
            ),
            &["stream"],
        )
        .expect("hardcoded metric descriptor");

        let dlq_depth = IntGaugeVec::new(
            Opts::new("waddlebot_dlq_depth", "Dead-letter stream depth"),
            &["stream"],
        )
        .expect("hardcoded metric descriptor");

        let reputation_events_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_reputation_events_total",
                "Reputation events by result",
            ),
            &["result"],
        )
        .expect("hardcoded metric descriptor");

        let reputation_policy_actions_total = IntCounterVec::new(
            Opts::new(
                "waddlebot_reputation_policy_actions_total",
                "Policy enforcement actions",
            ),
            &["action"],
        )
        .expect("hardcoded metric descriptor");

        let cache_hits_total = IntCounterVec::new(
            Opts::new("waddlebot_cache_hits_total", "Cache hits per cache"),
            &["cache"],
        )
        .expect("hardcoded metric descriptor");

        let cache_misses_total = IntCounterVec::new(
            Opts::new("waddlebot_cache_misses_total", "Cache misses per cache"),
            &["cache"],
        )
        .expect("hardcoded metric descriptor");

        for collector in [
            Box::new(events_ingested_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(webhook_rejections_total.clone()),
            Box::new(router_executions_total.clone()),
            Box::new(event_processing_duration_seconds.clone()),
            Box::new(dispatch_duration_seconds.clone()),
            Box::new(in_flight_dispatches.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(stream_entries_total.clone()),
            Box::new(stream_pending.clone()),
            Box::new(dlq_depth.clone()),
            Box::new(reputation_events_total.clone()),
            Box::new(reputation_policy_actions_total.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
        ] {
            registry.register(collector).expect("hardcoded metric");
        }

        Self {
            registry,
            events_ingested_total,
            webhook_rejections_total,
            router_executions_total,
            event_processing_duration_seconds,
            dispatch_duration_seconds,
            in_flight_dispatches,
            rate_limited_total,
            stream_entries_total,
            stream_pending,
            dlq_depth,
            reputation_events_total,
            reputation_policy_actions_total,
            cache_hits_total,
            cache_misses_total,
        }
    }

    /// Access the global metrics instance.
    pub fn global() -> &'static Self {
        &METRICS
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder as _;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(%error, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_as_text_exposition() {
        let metrics = Metrics::global();
        metrics
            .events_ingested_total
            .with_label_values(&["twitch", "chatMessage"])
            .inc();
        let text = metrics.encode();
        assert!(text.contains("waddlebot_events_ingested_total"));
    }
}
