//! Channel history storage
//!
//! Two interchangeable backends sit behind [`HistoryStore`]: a bounded
//! in-memory buffer and a PostgreSQL table. The relay picks one at startup.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::HistoryEntry;
use crate::Result;

pub use memory::MemoryHistory;
pub use postgres::PgHistoryStore;

/// Storage for recently published channel payloads
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short backend name used in logs and metrics
    fn backend_name(&self) -> &'static str;

    /// Record a payload published at `timestamp`
    async fn append(
        &self,
        channel: &str,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// The most recent `limit` entries for a channel, oldest first
    async fn query(&self, channel: &str, limit: usize) -> Result<Vec<HistoryEntry>>;
}
