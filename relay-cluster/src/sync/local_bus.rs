use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::bus::{BusMessage, MessageBus};

struct Endpoint {
    topics: HashSet<String>,
    sender: mpsc::Sender<BusMessage>,
}

/// In-process bus shared by several relay instances
///
/// Used by tests and for running more than one relay inside a single
/// process. Every endpoint subscribed to a topic receives every publish on
/// it, the publisher's own endpoint included.
#[derive(Clone, Default)]
pub struct LocalBusHub {
    endpoints: Arc<DashMap<u64, Endpoint>>,
    next_id: Arc<AtomicU64>,
}

impl LocalBusHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint; `buffer` bounds its inbound queue
    #[must_use]
    pub fn attach(&self, buffer: usize) -> (LocalBus, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.endpoints.insert(
            id,
            Endpoint {
                topics: HashSet::new(),
                sender: tx,
            },
        );

        (
            LocalBus {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

/// One relay's handle onto a [`LocalBusHub`]
pub struct LocalBus {
    id: u64,
    hub: LocalBusHub,
}

#[async_trait]
impl MessageBus for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let targets: Vec<mpsc::Sender<BusMessage>> = self
            .hub
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.topics.contains(topic))
            .map(|endpoint| endpoint.sender.clone())
            .collect();

        for target in targets {
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if let Err(e) = target.try_send(message) {
                debug!(topic = %topic, error = %e, "Local bus endpoint dropped message");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let Some(mut endpoint) = self.hub.endpoints.get_mut(&self.id) else {
            bail!("local bus endpoint detached");
        };
        endpoint.topics.insert(topic.to_string());
        Ok(())
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.hub.endpoints.remove(&self.id);
    }
}
