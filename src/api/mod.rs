// =============================================================================
// WebSocket boundary — ingest and feed adapters
// =============================================================================

pub mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;

/// Build the boundary router: the upstream ingest socket and the downstream
/// dashboard feed. CORS is configured permissively for development.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/feed", get(ws::feed_handler))
        .route("/ws/ingest", get(ws::ingest_handler))
        .layer(cors)
        .with_state(state)
}
