//! HTTP server setup: route wiring and graceful shutdown.

use super::state::ApiState;
use super::{health, router_api, webhooks};
use crate::reputation::service as reputation_service;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;

/// Build the full application router.
pub fn app(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router_routes = Router::new()
        .route("/events", post(router_api::ingest_event))
        .route("/events/batch", post(router_api::ingest_batch))
        .route("/responses", post(router_api::module_response))
        .route("/commands", get(router_api::list_commands))
        .route("/metrics", get(router_api::router_metrics));

    let reputation_routes = Router::new()
        .route("/record-event", post(reputation_service::record_event))
        .route("/get-score", post(reputation_service::get_score))
        .with_state(state.reputation.clone());

    let webhook_routes = Router::new()
        .route("/twitch/eventsub", post(webhooks::twitch_eventsub))
        .route("/kick", post(webhooks::kick_webhook))
        .route("/slack/events", post(webhooks::slack_events))
        .route("/slack/interactions", post(webhooks::slack_interactions))
        .route(
            "/youtube/websub",
            get(webhooks::youtube_websub_verify).post(webhooks::youtube_websub_notify),
        );

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .nest("/api/v1/router", router_routes)
        .nest("/webhooks", webhook_routes)
        .with_state(state)
        .nest("/api/v1/reputation", reputation_routes)
        .layer(cors)
}

/// Start the HTTP server on the given address.
///
/// Returns the `JoinHandle` so the caller can hold it for lifetime
/// management. The server shuts down when `shutdown_rx` signals true.
pub async fn start_http_server(
    bind: SocketAddr,
    state: ApiState,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind http server to {}: {}", bind, error))?;

    tracing::info!(address = %bind, "http server started");

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let shutdown_signal = async move {
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        };

        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            tracing::error!(%error, "http server failed");
        }
    });

    Ok(handle)
}
