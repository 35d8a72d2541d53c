// Module: http
// HTTP/JSON API and the WebSocket upgrade endpoint

pub mod channel;
pub mod error;
pub mod health;
pub mod metrics;
pub mod websocket;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use relay_cluster::sync::{ConnectionManager, FanoutEngine};
use relay_core::Config;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FanoutEngine>,
    pub connections: ConnectionManager,
    pub config: Arc<Config>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        // Health check endpoint (for monitoring probes)
        .merge(health::create_health_router())
        .route("/publish/{channel}", post(channel::publish))
        .route("/history/{channel}", get(channel::history))
        .route("/metrics", get(metrics::metrics))
        // WebSocket endpoint for real-time messaging
        .route("/ws", get(websocket::websocket_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Apply state to all routes (must be last)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origin == "*" {
        return layer.allow_origin(Any);
    }

    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(e) => {
            warn!(origin = %origin, error = %e, "Invalid CORS origin, allowing any");
            layer.allow_origin(Any)
        }
    }
}
