use axum::{extract::State, Json};
use relay_cluster::sync::RelayMetrics;

use crate::http::AppState;

/// Subscriber counts per channel plus process totals
pub async fn metrics(State(state): State<AppState>) -> Json<RelayMetrics> {
    Json(state.engine.metrics())
}
