//! Channel publish and history endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use relay_core::models::HistoryEntry;
use serde::{Deserialize, Serialize};

use crate::http::{AppResult, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: String,
    pub channel: String,
    /// Local subscribers the message was written to
    pub delivered: usize,
}

/// Publish the request body to a channel
///
/// The body is any JSON value; an empty body publishes `null`.
pub async fn publish(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    body: Bytes,
) -> AppResult<Json<PublishResponse>> {
    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)?
    };

    let result = state.engine.publish(&channel, payload);

    Ok(Json(PublishResponse {
        status: "ok".to_string(),
        channel: result.channel,
        delivered: result.delivered,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Number of most recent entries; unparseable values fall back to the default
    pub last: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub channel: String,
    pub items: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Recent history of a channel, oldest first
pub async fn history(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Json<HistoryResponse> {
    let limit = params.last.as_deref().and_then(|s| s.trim().parse::<usize>().ok());
    let result = state.engine.query_history(&channel, limit).await;

    Json(HistoryResponse {
        channel,
        items: result.items,
        error: result.error,
    })
}
