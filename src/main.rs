//! # Voice Session Backend - Main Application Entry Point
//!
//! Real-time voice conversation server. Clients stream microphone audio over a
//! WebSocket; the server buffers it per session, runs speech recognition,
//! generates a conversational reply and streams synthesized speech back.
//!
//! ## Application Architecture:
//! - **audio**: format conversion, chunk validation and per-session buffering
//! - **pipeline**: the speech-to-speech processing cycle
//! - **services**: recognition, reply generation and synthesis collaborators
//! - **chat**: conversation history and rate limiting over a key-value store
//! - **registry**: session id to live connection mapping
//! - **websocket**: the voice streaming protocol
//! - **handlers / health**: REST endpoints
//! - **config / state / error / middleware**: ambient server plumbing

mod audio;
mod chat;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod protocol;
mod registry;
mod services;
mod state;
mod store;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from config.toml and `APP__` environment variables
/// 2. **Creates shared application state** wiring the audio, chat and pipeline components
/// 3. **Starts session maintenance** (idle session eviction, store expiry)
/// 4. **Serves HTTP and WebSocket routes** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        recognition_url = %config.services.recognition_url,
        reply_url = %config.services.reply_url,
        synthesis_url = %config.services.synthesis_url,
        "Collaborator services configured"
    );

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    spawn_maintenance(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order of registration for requests
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/chat", web::post().to(handlers::send_chat_message))
                    .route("/chat/{session_id}", web::get().to(handlers::get_chat_history))
                    .route("/chat/{session_id}", web::delete().to(handlers::end_chat_session))
                    .route("/voice/sessions", web::get().to(handlers::list_voice_sessions))
                    .route(
                        "/voice/sessions/{session_id}",
                        web::get().to(handlers::get_voice_session),
                    ),
            )
            .route("/debug/self-test", web::post().to(handlers::self_test))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// ## Environment Variables:
/// - `RUST_LOG`: filter directives, defaulting to
///   "voice_session_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically evict idle voice sessions and expired store entries.
fn spawn_maintenance(state: AppState) {
    let performance = state.get_config().performance;
    let idle_limit = chrono::Duration::seconds(performance.session_idle_timeout_secs as i64);
    let period = Duration::from_secs(performance.maintenance_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let evicted = state.pipeline.evict_idle_sessions(idle_limit);
            if evicted > 0 {
                info!(evicted, "Evicted idle voice sessions");
            }

            match state.store.purge_expired().await {
                Ok(purged) => debug!(purged, "Purged expired store entries"),
                Err(e) => warn!(error = %e, "Store maintenance failed"),
            }
        }
    });
}

/// Resolve when SIGINT (Ctrl+C) or, on Unix, SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
