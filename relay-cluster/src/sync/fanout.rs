//! Delivery fan-out engine
//!
//! Entry point for everything that happens when a payload is published:
//! - persistence to the selected history backend
//! - delivery to local subscribers
//! - forwarding to other instances through the bus adapter

use chrono::{DateTime, Utc};
use relay_core::models::{HistoryEntry, InstanceId};
use relay_core::{HistoryStore, MemoryHistory};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::bus_adapter::BusAdapter;
use super::channel_registry::ChannelRegistry;
use super::events::RelayEvent;

/// Upper bound on a single durable history query
pub const MAX_DURABLE_QUERY: usize = 1000;

/// Capacity of the durable write queue
pub const DURABLE_QUEUE_CAPACITY: usize = 10_000;

struct PendingWrite {
    channel: String,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
}

/// Result of a publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub channel: String,
    /// Successful local sends; cross-instance deliveries are not counted
    pub delivered: usize,
    /// Whether the event was handed to the bus adapter
    pub forwarded: bool,
}

/// Result of a history query
///
/// A failed durable query yields no items and the error text; it is never
/// surfaced as a request failure.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub items: Vec<HistoryEntry>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStat {
    pub channel: String,
    pub subscribers: usize,
}

/// Point-in-time view of the relay
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    pub uptime_sec: u64,
    pub channels: Vec<ChannelStat>,
    pub total_subscriptions: usize,
    pub total_connections: usize,
    pub instance_id: InstanceId,
}

/// Delivery fan-out engine
pub struct FanoutEngine {
    identity: InstanceId,
    registry: ChannelRegistry,
    /// Backend that answers history queries, selected at startup
    history: Arc<dyn HistoryStore>,
    /// Bounded buffer; written directly when no durable store is set and
    /// the fallback when a durable write cannot be made
    memory: MemoryHistory,
    /// Queue drained by the durable writer task
    durable_tx: Option<mpsc::Sender<PendingWrite>>,
    bus: Option<Arc<BusAdapter>>,
    started_at: Instant,
}

impl FanoutEngine {
    #[must_use]
    pub fn new(identity: InstanceId, registry: ChannelRegistry, memory: MemoryHistory) -> Self {
        Self {
            identity,
            registry,
            history: Arc::new(memory.clone()),
            memory,
            durable_tx: None,
            bus: None,
            started_at: Instant::now(),
        }
    }

    /// Persist history in a durable store instead of the in-memory buffer.
    ///
    /// Spawns the writer task, so this must be called inside a runtime.
    #[must_use]
    pub fn with_durable(self, store: Arc<dyn HistoryStore>) -> Self {
        self.with_durable_queue(store, DURABLE_QUEUE_CAPACITY)
    }

    fn with_durable_queue(mut self, store: Arc<dyn HistoryStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(Self::run_durable_writer(store.clone(), self.memory.clone(), rx));
        self.history = store;
        self.durable_tx = Some(tx);
        self
    }

    /// Forward published events to other instances
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<BusAdapter>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Publish a payload to a channel.
    ///
    /// Returns once local delivery is done; durable persistence and bus
    /// forwarding complete in the background and their failures are only
    /// logged.
    pub fn publish(&self, channel: &str, payload: serde_json::Value) -> PublishResult {
        self.registry.ensure(channel);
        self.memory.ensure_slot(channel);

        let event = RelayEvent::message(channel, payload, self.identity.clone());
        if let RelayEvent::Message { payload, timestamp, .. } = &event {
            self.persist(channel, payload, *timestamp);
        }

        let delivered = self.deliver_local(channel, &event);

        let forwarded = match &self.bus {
            Some(bus) => {
                bus.forward(&event);
                true
            }
            None => false,
        };

        debug!(
            channel = %channel,
            delivered = delivered,
            forwarded = forwarded,
            "Published message"
        );

        PublishResult {
            channel: channel.to_string(),
            delivered,
            forwarded,
        }
    }

    /// Deliver an event to this instance's subscribers only
    pub fn deliver_local(&self, channel: &str, event: &RelayEvent) -> usize {
        self.registry.broadcast(channel, event)
    }

    fn persist(&self, channel: &str, payload: &serde_json::Value, timestamp: DateTime<Utc>) {
        let Some(durable_tx) = &self.durable_tx else {
            self.memory.push(channel, HistoryEntry::new(timestamp, payload.clone()));
            return;
        };

        let write = PendingWrite {
            channel: channel.to_string(),
            payload: payload.clone(),
            timestamp,
        };

        let write = match durable_tx.try_send(write) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(write)) => {
                warn!(channel = %channel, "Durable write queue full, keeping message in memory");
                write
            }
            Err(mpsc::error::TrySendError::Closed(write)) => {
                warn!(channel = %channel, "Durable writer stopped, keeping message in memory");
                write
            }
        };
        self.memory.push(&write.channel, HistoryEntry::new(write.timestamp, write.payload));
    }

    /// Drain the durable write queue until the engine is dropped
    async fn run_durable_writer(
        store: Arc<dyn HistoryStore>,
        memory: MemoryHistory,
        mut rx: mpsc::Receiver<PendingWrite>,
    ) {
        while let Some(write) = rx.recv().await {
            if let Err(e) = store.append(&write.channel, &write.payload, write.timestamp).await {
                warn!(
                    error = %e,
                    channel = %write.channel,
                    backend = store.backend_name(),
                    "Failed to persist message, keeping it in memory"
                );
                memory.push(&write.channel, HistoryEntry::new(write.timestamp, write.payload));
            }
        }
        debug!("Durable writer stopped");
    }

    /// The most recent history for a channel, oldest first.
    ///
    /// `limit` defaults to the in-memory capacity.
    pub async fn query_history(&self, channel: &str, limit: Option<usize>) -> HistoryQuery {
        let mut limit = limit.unwrap_or_else(|| self.memory.capacity());
        if self.durable_tx.is_some() {
            limit = limit.min(MAX_DURABLE_QUERY);
        }

        match self.history.query(channel, limit).await {
            Ok(items) => HistoryQuery { items, error: None },
            Err(e) => {
                warn!(error = %e, channel = %channel, "History query failed");
                HistoryQuery {
                    items: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    #[must_use]
    pub fn metrics(&self) -> RelayMetrics {
        let channels: Vec<ChannelStat> = self
            .registry
            .channel_counts()
            .into_iter()
            .map(|(channel, subscribers)| ChannelStat { channel, subscribers })
            .collect();

        RelayMetrics {
            uptime_sec: self.started_at.elapsed().as_secs(),
            total_subscriptions: channels.iter().map(|c| c.subscribers).sum(),
            channels,
            total_connections: self.registry.connection_count(),
            instance_id: self.identity.clone(),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &InstanceId {
        &self.identity
    }

    #[must_use]
    pub const fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn history_backend(&self) -> &'static str {
        self.history.backend_name()
    }

    /// Stop the bus adapter's background tasks
    pub fn shutdown(&self) {
        if let Some(bus) = &self.bus {
            bus.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::channel_registry::Outbound;
    use async_trait::async_trait;
    use mockall::mock;
    use relay_core::models::ConnectionId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Store {}

        #[async_trait]
        impl HistoryStore for Store {
            fn backend_name(&self) -> &'static str;
            async fn append(
                &self,
                channel: &str,
                payload: &serde_json::Value,
                timestamp: DateTime<Utc>,
            ) -> relay_core::Result<()>;
            async fn query(&self, channel: &str, limit: usize) -> relay_core::Result<Vec<HistoryEntry>>;
        }
    }

    fn engine(capacity: usize) -> FanoutEngine {
        FanoutEngine::new(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            MemoryHistory::new(capacity),
        )
    }

    fn subscribe(engine: &FanoutEngine, channel: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let id = ConnectionId::new();
        engine.registry().register(id.clone(), tx);
        engine.registry().subscribe(channel, &id);
        rx
    }

    #[tokio::test]
    async fn test_publish_delivers_to_local_subscribers() {
        let engine = engine(10);
        let mut rx1 = subscribe(&engine, "general");
        let mut rx2 = subscribe(&engine, "general");
        let mut other = subscribe(&engine, "other");

        let result = engine.publish("general", json!({"text": "hi"}));
        assert_eq!(result.delivered, 2);
        assert!(!result.forwarded);

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                Outbound::Event(RelayEvent::Message { channel, payload, origin, .. }) => {
                    assert_eq!(channel, "general");
                    assert_eq!(payload, json!({"text": "hi"}));
                    assert_eq!(&origin, engine.identity());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_creates_channel() {
        let engine = engine(10);

        let result = engine.publish("empty", json!(1));
        assert_eq!(result.delivered, 0);
        assert_eq!(engine.registry().channel_count(), 1);

        let history = engine.query_history("empty", None).await;
        assert_eq!(history.items.len(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_in_order() {
        let engine = engine(3);
        for n in 0..5 {
            engine.publish("general", json!(n));
        }

        let history = engine.query_history("general", None).await;
        let payloads: Vec<_> = history.items.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(2), json!(3), json!(4)]);
        assert!(history.error.is_none());
        assert_eq!(engine.history_backend(), "memory");

        let last_two = engine.query_history("general", Some(2)).await;
        assert_eq!(last_two.items.len(), 2);
        assert_eq!(last_two.items[1].payload, json!(4));
    }

    #[tokio::test]
    async fn test_durable_failure_falls_back_to_memory() {
        let mut store = MockStore::new();
        store.expect_backend_name().return_const("mock");
        store
            .expect_append()
            .times(1)
            .returning(|_, _, _| Err(relay_core::Error::Internal("disk full".to_string())));

        let memory = MemoryHistory::new(10);
        let engine = FanoutEngine::new(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            memory.clone(),
        )
        .with_durable(Arc::new(store));
        let mut rx = subscribe(&engine, "general");

        let result = engine.publish("general", json!("kept"));
        assert_eq!(result.delivered, 1);
        assert!(rx.try_recv().is_ok());

        for _ in 0..50 {
            if memory.len("general") == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(memory.recent("general", 10)[0].payload, json!("kept"));
    }

    /// Store whose appends never complete
    struct StalledStore {
        appends: AtomicUsize,
    }

    #[async_trait]
    impl HistoryStore for StalledStore {
        fn backend_name(&self) -> &'static str {
            "stalled"
        }

        async fn append(
            &self,
            _channel: &str,
            _payload: &serde_json::Value,
            _timestamp: DateTime<Utc>,
        ) -> relay_core::Result<()> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn query(&self, _channel: &str, _limit: usize) -> relay_core::Result<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stalled_durable_store_is_bounded() {
        let store = Arc::new(StalledStore {
            appends: AtomicUsize::new(0),
        });
        let memory = MemoryHistory::new(10);
        let engine = FanoutEngine::new(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            memory.clone(),
        )
        .with_durable_queue(store.clone(), 1);

        // The writer task has not run yet: one write fits, the rest overflow
        for n in 0..3 {
            assert_eq!(engine.publish("general", json!(n)).delivered, 0);
        }
        let kept: Vec<_> = memory.recent("general", 10).into_iter().map(|e| e.payload).collect();
        assert_eq!(kept, vec![json!(1), json!(2)]);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.appends.load(Ordering::SeqCst), 1);

        // Later publishes still return without waiting on the store
        engine.publish("general", json!(3));
        engine.publish("general", json!(4));
        assert_eq!(memory.len("general"), 3);
        assert_eq!(engine.history_backend(), "stalled");
    }

    #[tokio::test]
    async fn test_durable_query_failure_returns_error_flag() {
        let mut store = MockStore::new();
        store.expect_backend_name().return_const("mock");
        store
            .expect_query()
            .returning(|_, _| Err(relay_core::Error::Internal("connection refused".to_string())));

        let engine = engine(10).with_durable(Arc::new(store));
        let history = engine.query_history("general", Some(5)).await;

        assert!(history.items.is_empty());
        assert!(history.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_durable_query_limit_is_capped() {
        let mut store = MockStore::new();
        store.expect_backend_name().return_const("mock");
        store
            .expect_query()
            .withf(|channel, limit| channel == "general" && *limit == MAX_DURABLE_QUERY)
            .times(1)
            .returning(|_, _| Ok(Vec::new()));

        let engine = engine(10).with_durable(Arc::new(store));
        let history = engine.query_history("general", Some(50_000)).await;
        assert!(history.items.is_empty());
        assert!(history.error.is_none());
        assert_eq!(engine.history_backend(), "mock");
    }

    #[tokio::test]
    async fn test_metrics_reflect_subscriptions() {
        let engine = engine(10);
        let _a = subscribe(&engine, "a");
        let _b1 = subscribe(&engine, "b");
        let _b2 = subscribe(&engine, "b");

        let metrics = engine.metrics();
        assert_eq!(
            metrics.channels,
            vec![
                ChannelStat { channel: "a".to_string(), subscribers: 1 },
                ChannelStat { channel: "b".to_string(), subscribers: 2 },
            ]
        );
        assert_eq!(metrics.total_subscriptions, 3);
        assert_eq!(metrics.total_connections, 3);
        assert_eq!(metrics.instance_id.as_str(), "node-a");

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["totalSubscriptions"], 3);
        assert_eq!(json["instanceId"], "node-a");
        assert!(json["uptimeSec"].is_u64());
    }
}
