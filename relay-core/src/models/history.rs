use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A payload previously published to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl HistoryEntry {
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self { timestamp, payload }
    }
}
