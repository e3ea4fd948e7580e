//! # Companion Live - Main Application Entry Point
//!
//! Realtime voice sessions with AI companion characters. A client opens a
//! WebSocket, authenticates, and then talks to a character backed by a
//! streaming speech model. The server keeps the conversation continuous across
//! the model's per-turn stream endings, tracks the character's emotion, and lets
//! the character speak up on its own when the moment calls for it.
//!
//! ## Application Architecture:
//! - **config**: application configuration (defaults, config.toml, environment)
//! - **state**: shared state, collaborators and metrics
//! - **affect**: the emotion model (circumplex labels, inertia, personality)
//! - **live**: the resumable link to the upstream realtime model
//! - **session**: per-connection orchestration and the client wire protocol
//! - **scheduler**: emotional bursts, idle prompts and delayed proactive messages
//! - **services**: collaborator traits and their default implementations
//! - **websocket**: the `/ws` transport actor
//! - **health** / **handlers**: HTTP endpoints
//! - **error**: error types and their HTTP / wire mappings

mod affect;
mod config;
mod error;
mod handlers;
mod health;
mod live;
mod scheduler;
mod services;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use live::GeminiConnector;
use services::{GeminiTextClient, InMemoryStore, Services};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handlers; polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting companion-live v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = build_state(&config);
    spawn_lock_sweeper(&app_state, Duration::from_secs(config.proactive.lock_sweep_interval_secs));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers()?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::companion_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/chat", web::post().to(handlers::chat)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Wire the collaborators: the in-memory store seeded with the configured
/// characters, the upstream connector, and text generation when a key is set.
fn build_state(config: &AppConfig) -> AppState {
    let store = Arc::new(InMemoryStore::with_characters(config.characters.iter().cloned()));
    info!(characters = store.character_count(), "Character catalog seeded");

    let upstream = &config.upstream;
    let mut services = Services::in_memory(store);
    if upstream.api_key.is_empty() {
        warn!("No upstream API key configured; live sessions will fail to connect");
    } else {
        services = services.with_generator(Arc::new(GeminiTextClient::new(
            upstream.api_key.clone(),
            upstream.text_model.clone(),
            upstream.text_endpoint.clone(),
        )));
    }

    let connector = Arc::new(GeminiConnector::new(
        upstream.api_key.clone(),
        upstream.live_endpoint.clone(),
        upstream.live_model.clone(),
        upstream.voice.clone(),
    ));

    AppState::new(config.clone(), services, connector)
}

/// Periodically drop per-pair proactive locks that nobody holds.
fn spawn_lock_sweeper(state: &AppState, every: Duration) {
    let locks = state.proactive.locks().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = locks.sweep();
            if removed > 0 {
                info!(removed, remaining = locks.len(), "Swept idle proactive locks");
            }
        }
    });
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "companion_live=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// SIGTERM or SIGINT sets [`SHUTDOWN_SIGNAL`].
fn setup_signal_handlers() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });

    Ok(())
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
