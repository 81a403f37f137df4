// Inference-engine gateway for the virtual-tutor service
//
// Browser clients hold one long-lived WebSocket to this process, send text
// or utterances, and receive a coordinated stream of assistant text,
// synthesized speech, and lip-synced avatar video. The web backend mints
// sessions over the HTTP admission API before the client connects.
//
// Architecture:
// - Admission API (axum): session lifecycle, health, ICE configuration
// - Connection gateway: WebSocket auth + per-connection message loop
// - Message router: typed dispatch into the engines and pipelines
// - Engine cache: per-tutor LLM/ASR/TTS/RAG bundles
// - Lip-sync pipeline: TTS -> features -> inference worker threads
// - Media transport: relay-only WebRTC with paced audio/video tracks

mod api;
mod avatar;
mod config;
mod engine;
mod error;
mod gateway;
mod media;
mod pipeline;
mod process;
mod sessions;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use avatar::AvatarManager;
use config::Config;
use engine::EngineCache;
use gateway::Connections;
use media::MediaTransport;
use pipeline::LipSyncEngines;
use sessions::SessionRegistry;
use state::AppState;

/// Interval of the periodic idle-session sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env());

    // Precedence: RUST_LOG env var > config level > "info"
    let default_filter = format!("tutorgw={},tower_http=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = config::VERSION, "Starting inference-engine gateway");
    tracing::info!(
        max_sessions = config.session.max_sessions,
        session_timeout = config.session.timeout_seconds,
        avatar = config.features.avatar,
        llm = config.features.llm,
        "Configuration loaded"
    );

    // Shared HTTP client for every collaborator
    // Generous timeout: LLM turns can run long
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create HTTP client")?;

    let registry = Arc::new(SessionRegistry::new(
        config.session.max_sessions,
        Duration::from_secs(config.session.timeout_seconds),
    ));
    let avatars = Arc::new(AvatarManager::new(&config.avatar));
    let engines = Arc::new(EngineCache::new(
        Arc::clone(&config),
        http,
        Arc::clone(&avatars),
    ));
    let lipsync = Arc::new(LipSyncEngines::new(
        Arc::clone(&config),
        Arc::clone(&avatars),
    ));
    let transport =
        Arc::new(MediaTransport::new(config.webrtc.clone()).context("Failed to build WebRTC API")?);

    let state = AppState {
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
        engines,
        avatars,
        lipsync,
        transport,
        connections: Arc::new(Connections::new()),
    };

    // Periodic idle-session sweep; creation sweeps on its own as well
    let sweep_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_registry.sweep();
        }
    });

    let app = api::router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Gateway listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
