//! Health check endpoint
//!
//! Provides simple health check for monitoring probes.

use axum::{response::IntoResponse, routing::get, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(health_check))
}

/// Basic health check (always returns ok if server is running)
pub async fn health_check() -> impl IntoResponse {
    "ok"
}
