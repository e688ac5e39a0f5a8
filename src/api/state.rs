//! Shared state handed to every handler.

use crate::auth::ServiceAuth;
use crate::config::Config;
use crate::db::Db;
use crate::pipeline::RedisStreams;
use crate::receivers::{ChannelDirectory, EnvelopeSink};
use crate::reputation::service::ReputationServiceState;
use crate::router::{CommandStore, EventProcessor};

use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub db: Db,
    pub streams: Option<RedisStreams>,
    pub processor: Arc<EventProcessor>,
    pub commands: Arc<CommandStore>,
    pub reputation: ReputationServiceState,
    pub auth: ServiceAuth,
    pub sink: Option<EnvelopeSink>,
    pub directory: Arc<ChannelDirectory>,
}

impl ApiState {
    /// Ingest an envelope produced by a webhook: publish to the inbound
    /// stream when the pipeline is enabled, process inline otherwise.
    pub async fn ingest(&self, envelope: crate::EventEnvelope) {
        if let Some(sink) = &self.sink {
            if let Err(error) = sink.publish(&envelope).await {
                tracing::error!(%error, event_id = %envelope.event_id, "inbound publish failed");
            }
            return;
        }
        if let Err(error) = self.processor.process_event(&envelope).await {
            tracing::debug!(%error, event_id = %envelope.event_id, "inline processing failed");
        }
    }
}
