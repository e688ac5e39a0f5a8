//! Receiver trait and dynamic dispatch companion.

use crate::error::Result;
use crate::pipeline::{RedisStreams, streams};
use crate::telemetry::Metrics;
use crate::{EventEnvelope, Platform};

use futures::Stream;
use std::pin::Pin;

/// Envelope stream type.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

/// Static trait for trigger receivers.
/// Use this for type-safe implementations.
pub trait Receiver: Send + Sync + 'static {
    /// The platform this receiver ingests.
    fn platform(&self) -> Platform;

    /// Start the receiver and return its inbound envelope stream.
    fn start(&self) -> impl std::future::Future<Output = Result<EnvelopeStream>> + Send;

    /// Health check.
    fn health_check(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn ReceiverDyn>` for storing different receivers.
pub trait ReceiverDyn: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<EnvelopeStream>> + Send + 'a>>;

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Receiver automatically
/// implements ReceiverDyn.
impl<T: Receiver> ReceiverDyn for T {
    fn platform(&self) -> Platform {
        Receiver::platform(self)
    }

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<EnvelopeStream>> + Send + 'a>> {
        Box::pin(Receiver::start(self))
    }

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Receiver::health_check(self))
    }

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Receiver::shutdown(self))
    }
}

/// Outbound side shared by every receiver: publish envelopes to the inbound
/// stream, keyed by entity.
#[derive(Clone)]
pub struct EnvelopeSink {
    streams: RedisStreams,
}

impl EnvelopeSink {
    pub fn new(streams: RedisStreams) -> Self {
        Self { streams }
    }

    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| crate::error::ReceiverError::MalformedPayload(e.to_string()))?;
        self.streams
            .publish(streams::INBOUND, &envelope.event_id, &payload)
            .await?;
        Metrics::global()
            .events_ingested_total
            .with_label_values(&[envelope.platform.as_str(), envelope.event_type.as_str()])
            .inc();
        Ok(())
    }
}
