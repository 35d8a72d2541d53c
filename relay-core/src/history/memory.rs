use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use super::HistoryStore;
use crate::models::HistoryEntry;
use crate::Result;

/// Bounded per-channel FIFO of past payloads
///
/// Each channel keeps at most `capacity` entries; appending to a full
/// channel evicts the oldest entry.
#[derive(Clone)]
pub struct MemoryHistory {
    channels: Arc<DashMap<String, VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl MemoryHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create an empty slot for a channel (idempotent)
    pub fn ensure_slot(&self, channel: &str) {
        if !self.channels.contains_key(channel) {
            self.channels
                .entry(channel.to_string())
                .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        }
    }

    pub fn push(&self, channel: &str, entry: HistoryEntry) {
        let mut slot = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        slot.push_back(entry);
        while slot.len() > self.capacity {
            slot.pop_front();
        }
    }

    #[must_use]
    pub fn recent(&self, channel: &str, limit: usize) -> Vec<HistoryEntry> {
        self.channels
            .get(channel)
            .map(|slot| {
                let skip = slot.len().saturating_sub(limit);
                slot.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |slot| slot.len())
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append(
        &self,
        channel: &str,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.push(channel, HistoryEntry::new(timestamp, payload.clone()));
        Ok(())
    }

    async fn query(&self, channel: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.recent(channel, limit))
    }
}
