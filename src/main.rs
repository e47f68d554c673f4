// =============================================================================
// tickflow — Main Entry Point
// =============================================================================
//
// Wires the streaming core together: pipeline, fan-out hub, persistence
// writer, batch flusher, reconnect controller and the WebSocket boundary.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod cache;
mod flusher;
mod focus;
mod hub;
mod normalizer;
mod persistence;
mod pipeline;
mod reconnect;
mod runtime_config;
mod stream_buffer;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::flusher::{BatchFlusher, JsonlStore};
use crate::persistence::PersistenceWriter;
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("TICKFLOW_CONFIG").unwrap_or_else(|_| "tickflow_config.json".into());

    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for the most commonly tuned knobs.
    if let Ok(mode) = std::env::var("TICKFLOW_COLLECT_STREAM") {
        match mode.parse() {
            Ok(mode) => config.collect_stream = mode,
            Err(e) => warn!(error = %e, "ignoring TICKFLOW_COLLECT_STREAM"),
        }
    }
    if let Ok(tfs) = std::env::var("TICKFLOW_TIMEFRAMES") {
        let parsed: Vec<_> = tfs
            .split(',')
            .filter_map(|s| crate::types::Timeframe::parse(s))
            .collect();
        if parsed.is_empty() {
            warn!(value = %tfs, "ignoring TICKFLOW_TIMEFRAMES — no valid timeframes");
        } else {
            config.timeframes = parsed;
        }
    }

    info!(
        timeframes = ?config.timeframes.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
        collect_stream = %config.collect_stream,
        buffer_capacity = config.buffer_capacity,
        "tickflow starting"
    );

    // ── 2. Build shared state (spawns pipeline + reconnect controller) ───
    let state = AppState::new(config.clone());

    // ── 3. Persistence writer ────────────────────────────────────────────
    let writer = PersistenceWriter::new(
        &config.data_dir,
        config.collect_stream,
        config.candle_chunk_size,
        config.tick_chunk_size,
    );
    tokio::spawn(writer.run(state.hub.subscribe(None)));

    // ── 4. Buffer feeder + batch flusher ─────────────────────────────────
    tokio::spawn(pipeline::run_buffer_feeder(
        state.hub.subscribe(None),
        state.stream_buffer.clone(),
    ));

    let flusher = BatchFlusher::new(
        state.stream_buffer.clone(),
        Arc::new(JsonlStore::new(&config.durable_dir)),
        Duration::from_secs(config.flush_interval_secs),
        config.flush_max_attempts,
        Duration::from_secs(config.flush_attempt_timeout_secs),
    );
    tokio::spawn(flusher.run());

    // ── 5. WebSocket boundary ────────────────────────────────────────────
    let bind_addr =
        std::env::var("TICKFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "WebSocket boundary listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("tickflow shut down complete.");
    Ok(())
}
