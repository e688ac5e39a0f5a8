//! WaddleBot CLI entry point and composition root.
//!
//! One binary runs the whole hot path: trigger receivers, the stream
//! pipeline, the router, the reputation engine, the action pushers, and the
//! HTTP surface. Dependencies are constructed once here and threaded
//! explicitly; nothing initializes itself at module load.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use waddlebot::actions::ActionManager;
use waddlebot::api::ApiState;
use waddlebot::auth::ServiceAuth;
use waddlebot::config::Config;
use waddlebot::db::Db;
use waddlebot::pipeline::{RedisStreams, StreamConsumer, streams};
use waddlebot::ratelimit::RateLimiter;
use waddlebot::receivers::{ChannelDirectory, EnvelopeSink, ReceiverDyn};
use waddlebot::reputation::ReputationEngine;
use waddlebot::reputation::service::ReputationServiceState;
use waddlebot::router::processor::{ActivityClient, run_response_consumer};
use waddlebot::router::{
    CommandStore, CorrelationMap, Dispatcher, EventProcessor, RoutingTable, SessionManager,
};
use waddlebot::{audit, receivers};

#[derive(Parser)]
#[command(name = "waddlebot", version)]
#[command(about = "Multi-platform community bot: event router, reputation engine, receivers")]
struct Cli {
    /// Enable debug logging regardless of LOG_LEVEL
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls provider installs once");

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(1);
        }
    };

    let filter = if cli.debug {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("runtime startup failed: {error}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Dependency(error)) => {
            tracing::error!(%error, "dependency unreachable at startup");
            ExitCode::from(3)
        }
        Err(StartupError::Runtime(error)) => {
            tracing::error!(%error, "runtime failure at startup");
            ExitCode::from(2)
        }
    }
}

enum StartupError {
    /// DB/Redis/upstream unreachable: exit code 3.
    Dependency(anyhow::Error),
    /// Everything else at startup: exit code 2.
    Runtime(anyhow::Error),
}

async fn run(config: Config) -> Result<(), StartupError> {
    audit::system("waddlebot starting");
    let config = Arc::new(config);

    // -- Storage --
    let db = Db::connect(&config.database)
        .await
        .map_err(|e| StartupError::Dependency(e.into()))?;
    db.init_schema()
        .await
        .map_err(|e| StartupError::Runtime(e.into()))?;

    let streams_handle = match RedisStreams::connect(&config.redis.url).await {
        Ok(handle) => Some(handle),
        Err(error) if config.stream.enabled => {
            return Err(StartupError::Dependency(anyhow::anyhow!(
                "redis required for the stream pipeline: {error}"
            )));
        }
        Err(error) => {
            tracing::warn!(%error, "redis unavailable; using in-memory fallbacks");
            None
        }
    };
    let redis_pool = streams_handle.as_ref().map(|s| s.pool());

    // -- Shared services --
    let auth = ServiceAuth::new(&config.security);
    let limiter = Arc::new(RateLimiter::new(redis_pool.clone(), "router"));
    let sessions = Arc::new(SessionManager::new(
        redis_pool.clone(),
        config.router.session_ttl_secs,
    ));
    let routing = Arc::new(RoutingTable::new(
        db.clone(),
        config.router.entity_cache_ttl_secs,
    ));
    let commands = Arc::new(CommandStore::new(
        db.clone(),
        config.router.command_cache_ttl_secs,
    ));
    let dispatcher = Arc::new(Dispatcher::new(auth.clone(), config.stream.max_retries));
    let correlation = Arc::new(CorrelationMap::new());

    // -- Action pushers --
    let mut action_manager = ActionManager::new();
    if let Some(twitch_config) = &config.platforms.twitch {
        let tokens = Arc::new(receivers::twitch::TokenManager::new(
            db.clone(),
            twitch_config,
        ));
        action_manager.register(waddlebot::actions::twitch::TwitchPusher::new(
            tokens,
            twitch_config.client_id.clone(),
            twitch_config.bot_user_id.clone(),
        ));
    }
    if let Some(discord_config) = &config.platforms.discord {
        action_manager.register(waddlebot::actions::discord::DiscordPusher::new(
            &discord_config.bot_token,
        ));
    }
    if let Some(slack_config) = &config.platforms.slack {
        action_manager.register(waddlebot::actions::slack::SlackPusher::new(
            slack_config.bot_token.clone(),
        ));
    }
    if let Some(access_token) = config
        .platforms
        .kick
        .as_ref()
        .and_then(|k| k.access_token.clone())
    {
        action_manager.register(waddlebot::actions::kick::KickPusher::new(access_token));
    }
    let action_manager = Arc::new(action_manager);

    // -- Reputation engine --
    let reputation = Arc::new(ReputationEngine::new(
        db.clone(),
        config.reputation.clone(),
        action_manager.clone(),
        redis_pool.clone(),
    ));

    // -- Router --
    let activity = config
        .hub_activity_url
        .clone()
        .map(ActivityClient::new);
    let mut processor = EventProcessor::new(
        config.router.clone(),
        commands.clone(),
        sessions,
        routing.clone(),
        limiter,
        dispatcher,
        correlation.clone(),
        streams_handle.clone(),
        Some(reputation.clone()),
        activity,
    );
    if config.translation.enabled {
        processor = processor.with_translation(Arc::new(
            waddlebot::translation::TranslationPreprocessor::new(config.translation.clone()),
        ));
    }
    let processor = Arc::new(processor);

    // -- Channel discovery --
    let directory = Arc::new(ChannelDirectory::new(routing.clone()));
    if let Err(error) = directory.refresh().await {
        tracing::warn!(%error, "initial channel discovery failed");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(
        directory
            .clone()
            .run_refresh_loop(config.router.discovery_refresh_secs, shutdown_rx.clone()),
    ));

    // -- Stream consumers --
    if let Some(streams_handle) = &streams_handle {
        for worker in 0..config.stream.consumer_count {
            let consumer = StreamConsumer::new(
                streams_handle.clone(),
                streams::INBOUND,
                "router",
                format!("router-{worker}"),
                config.stream,
                config.router.max_concurrent,
                processor.clone(),
            );
            tasks.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
        }

        let actions_consumer = StreamConsumer::new(
            streams_handle.clone(),
            streams::ACTIONS,
            "actions",
            "actions-0".to_string(),
            config.stream,
            config.router.max_concurrent,
            action_manager.clone(),
        );
        tasks.push(tokio::spawn(actions_consumer.run(shutdown_rx.clone())));

        tasks.push(tokio::spawn(run_response_consumer(
            streams_handle.clone(),
            processor.clone(),
            config.stream,
            "responses-0".to_string(),
            shutdown_rx.clone(),
        )));
    }

    // -- Receivers --
    // Started receivers are held for the process lifetime; dropping one
    // would close its internal shutdown channel and stop its socket loop.
    let sink = streams_handle.clone().map(EnvelopeSink::new);
    let mut active_receivers: Vec<Box<dyn ReceiverDyn>> = Vec::new();
    for receiver in build_receivers(&config, directory.clone()) {
        let platform = receiver.platform();
        match receiver.start().await {
            Ok(mut stream) => {
                let sink = sink.clone();
                let processor = processor.clone();
                tasks.push(tokio::spawn(async move {
                    use futures::StreamExt as _;
                    while let Some(envelope) = stream.next().await {
                        match &sink {
                            Some(sink) => {
                                if let Err(error) = sink.publish(&envelope).await {
                                    tracing::error!(%error, "inbound publish failed");
                                }
                            }
                            None => {
                                if let Err(error) = processor.process_event(&envelope).await {
                                    tracing::debug!(%error, "inline processing failed");
                                }
                            }
                        }
                    }
                }));
                audit::system(&format!("{platform} receiver started"));
                active_receivers.push(receiver);
            }
            Err(error) => {
                tracing::error!(%error, %platform, "receiver failed to start");
            }
        }
    }

    // -- Housekeeping --
    {
        let processor = processor.clone();
        let reputation = reputation.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        processor.expire_stale_executions();
                        reputation.retry_failed_policies().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    // -- HTTP surface --
    let api_state = ApiState {
        config: config.clone(),
        db: db.clone(),
        streams: streams_handle.clone(),
        processor: processor.clone(),
        commands,
        reputation: ReputationServiceState {
            engine: reputation.clone(),
            auth: auth.clone(),
        },
        auth,
        sink,
        directory,
    };
    let bind: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
    let server = waddlebot::api::start_http_server(bind, api_state, shutdown_rx)
        .await
        .map_err(StartupError::Runtime)?;
    tasks.push(server);

    audit::system("waddlebot started");

    // -- Shutdown --
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| StartupError::Runtime(e.into()))?;
    audit::system("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for receiver in &active_receivers {
        if let Err(error) = receiver.shutdown().await {
            tracing::warn!(%error, platform = %receiver.platform(), "receiver shutdown failed");
        }
    }

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if tokio::time::timeout(grace, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period expired; cancelling remaining work");
    }

    audit::system("waddlebot stopped");
    Ok(())
}

/// Instantiate a receiver for every platform with credentials configured.
fn build_receivers(
    config: &Config,
    directory: Arc<ChannelDirectory>,
) -> Vec<Box<dyn ReceiverDyn>> {
    let mut receivers: Vec<Box<dyn ReceiverDyn>> = Vec::new();

    if let Some(twitch_config) = &config.platforms.twitch {
        receivers.push(Box::new(receivers::twitch::TwitchReceiver::new(
            twitch_config.clone(),
            directory.clone(),
        )));
    }
    if let Some(discord_config) = &config.platforms.discord {
        receivers.push(Box::new(receivers::discord::DiscordReceiver::new(
            discord_config,
        )));
    }
    if let Some(youtube_config) = &config.platforms.youtube {
        receivers.push(Box::new(receivers::youtube::YoutubeReceiver::new(
            youtube_config,
            directory.clone(),
        )));
    }
    if let Some(kick_config) = &config.platforms.kick {
        receivers.push(Box::new(receivers::kick::KickReceiver::new(
            kick_config.clone(),
            directory.clone(),
        )));
    }

    receivers
}
