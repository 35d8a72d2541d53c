use dashmap::DashMap;
use relay_core::models::InstanceId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{channel_from_topic, topic_for, BusMessage, MessageBus};
use super::channel_registry::ChannelRegistry;
use super::events::RelayEvent;

/// Timeout for a single bus subscribe call in seconds
const BUS_TIMEOUT_SECS: u64 = 5;

/// What happened to a message received from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Delivered to this many local subscribers
    Delivered(usize),
    /// Published by this instance and already delivered locally
    SelfOrigin,
    /// Not a message event
    Malformed,
    /// Topic does not map to a relay channel
    UnknownTopic,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
}

struct OutboundMessage {
    topic: String,
    payload: String,
}

/// Bridges the local channel registry to a shared [`MessageBus`]
///
/// Outbound: locally published events are queued on a bounded channel and a
/// pump task hands them to the bus. A full queue drops the event with a
/// warning; publish errors are logged and never retried.
///
/// Inbound: bus messages are decoded, events stamped with this instance's
/// identity are dropped, and everything else is delivered to local
/// subscribers only. Received events are never persisted or re-published.
pub struct BusAdapter {
    identity: InstanceId,
    registry: ChannelRegistry,
    bus: Arc<dyn MessageBus>,
    /// Bus topics of this process. Concurrent callers for the same topic
    /// share one in-flight subscribe through the cell.
    topics: DashMap<String, Arc<OnceCell<bool>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    counters: Arc<Counters>,
    cancel_token: CancellationToken,
}

impl BusAdapter {
    /// Capacity of the outbound queue
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    /// Create the adapter and spawn its pump and inbound tasks
    pub fn start(
        identity: InstanceId,
        registry: ChannelRegistry,
        bus: Arc<dyn MessageBus>,
        inbound_rx: mpsc::Receiver<BusMessage>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(Self::PUBLISH_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        tokio::spawn(Self::run_publisher(
            bus.clone(),
            outbound_rx,
            counters.clone(),
            cancel_token.clone(),
        ));

        let adapter = Arc::new(Self {
            identity,
            registry,
            bus,
            topics: DashMap::new(),
            outbound_tx,
            counters,
            cancel_token,
        });

        tokio::spawn(Self::run_inbound(Arc::downgrade(&adapter), inbound_rx, adapter.cancel_token.clone()));

        info!(
            bus = adapter.bus.name(),
            instance_id = %adapter.identity,
            "Bus adapter started"
        );

        adapter
    }

    /// Subscribe this process to the channel's bus topic unless it already is.
    ///
    /// Returns true if this call made the bus subscription. A caller that
    /// arrives while another subscribe is in flight waits for its result; if
    /// that attempt failed the waiter tries once more itself. A failed
    /// subscribe is forgotten so a later request can try again.
    pub async fn ensure_topic(&self, channel: &str) -> bool {
        let topic = topic_for(channel);

        for _ in 0..2 {
            let cell = self.topics.entry(topic.clone()).or_default().clone();
            let mut attempted = false;
            let subscribed = *cell
                .get_or_init(|| {
                    attempted = true;
                    self.subscribe_topic(&topic)
                })
                .await;

            if subscribed {
                return attempted;
            }

            self.topics.remove_if(&topic, |_, current| Arc::ptr_eq(current, &cell));
            if attempted {
                return false;
            }
            debug!(topic = %topic, "Concurrent bus subscribe failed, retrying");
        }

        false
    }

    async fn subscribe_topic(&self, topic: &str) -> bool {
        match timeout(Duration::from_secs(BUS_TIMEOUT_SECS), self.bus.subscribe(topic)).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, "Subscribed to bus topic");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, topic = %topic, "Bus subscribe failed");
                false
            }
            Err(_) => {
                warn!(topic = %topic, "Timed out subscribing to bus topic");
                false
            }
        }
    }

    /// Queue a locally originated event for the other instances
    pub fn forward(&self, event: &RelayEvent) {
        let Some(channel) = event.channel() else {
            return;
        };

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, channel = %channel, "Failed to serialize event for bus");
                return;
            }
        };

        let message = OutboundMessage {
            topic: topic_for(channel),
            payload,
        };

        match self.outbound_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %channel, "Bus publish queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %channel, "Bus publish queue closed, dropping event");
            }
        }
    }

    /// Decode and deliver one message received from the bus
    pub fn handle_inbound(&self, message: &BusMessage) -> InboundOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(channel) = channel_from_topic(&message.topic) else {
            debug!(topic = %message.topic, "Ignoring message on foreign topic");
            return InboundOutcome::UnknownTopic;
        };

        let event = match serde_json::from_str::<RelayEvent>(&message.payload) {
            Ok(event @ RelayEvent::Message { .. }) => event,
            Ok(other) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %message.topic, event_type = other.event_type(), "Ignoring non-message bus event");
                return InboundOutcome::Malformed;
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, topic = %message.topic, "Discarding undecodable bus message");
                return InboundOutcome::Malformed;
            }
        };

        if event.origin() == Some(&self.identity) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, "Ignoring event from self");
            return InboundOutcome::SelfOrigin;
        }

        let delivered = self.registry.broadcast(channel, &event);
        debug!(
            channel = %channel,
            local_subscribers = delivered,
            "Forwarded bus event to local subscribers"
        );

        InboundOutcome::Delivered(delivered)
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.topics
            .get(&topic_for(channel))
            .is_some_and(|entry| entry.value().get() == Some(&true))
    }

    /// Topics with a completed bus subscription
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics
            .iter()
            .filter(|entry| entry.value().get() == Some(&true))
            .count()
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &InstanceId {
        &self.identity
    }

    /// Stop the pump and inbound tasks
    pub fn shutdown(&self) {
        info!("Shutting down bus adapter");
        self.cancel_token.cancel();
    }

    async fn run_publisher(
        bus: Arc<dyn MessageBus>,
        mut outbound_rx: mpsc::Receiver<OutboundMessage>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Bus publisher task cancelled");
                    return;
                }
                message = outbound_rx.recv() => message,
            };

            let Some(message) = message else {
                debug!("Bus publish queue closed, exiting");
                return;
            };

            match bus.publish(&message.topic, message.payload).await {
                Ok(()) => {
                    counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, topic = %message.topic, "Failed to publish event to bus");
                }
            }
        }
    }

    async fn run_inbound(
        adapter: std::sync::Weak<Self>,
        mut inbound_rx: mpsc::Receiver<BusMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Bus inbound task cancelled");
                    return;
                }
                message = inbound_rx.recv() => message,
            };

            let Some(message) = message else {
                warn!("Bus inbound channel closed, running single-instance");
                return;
            };

            let Some(adapter) = adapter.upgrade() else {
                return;
            };
            adapter.handle_inbound(&message);
        }
    }
}

impl Drop for BusAdapter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
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
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    mock! {
        Bus {}

        #[async_trait]
        impl MessageBus for Bus {
            fn name(&self) -> &'static str;
            async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;
            async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;
        }
    }

    fn quiet_bus() -> MockBus {
        let mut bus = MockBus::new();
        bus.expect_name().return_const("mock");
        bus.expect_publish().returning(|_, _| Ok(()));
        bus.expect_subscribe().returning(|_| Ok(()));
        bus
    }

    fn local_subscriber(registry: &ChannelRegistry, channel: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        let id = ConnectionId::new();
        registry.register(id.clone(), tx);
        registry.subscribe(channel, &id);
        rx
    }

    fn bus_message(event: &RelayEvent) -> BusMessage {
        BusMessage {
            topic: topic_for(event.channel().unwrap()),
            payload: serde_json::to_string(event).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_self_origin_is_discarded() {
        let identity = InstanceId::from_string("node-a".to_string());
        let registry = ChannelRegistry::new();
        let mut rx = local_subscriber(&registry, "general");
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(identity.clone(), registry, Arc::new(quiet_bus()), inbound_rx);

        let own = RelayEvent::message("general", json!(1), identity);
        assert_eq!(adapter.handle_inbound(&bus_message(&own)), InboundOutcome::SelfOrigin);
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_foreign_origin_is_delivered_locally() {
        let registry = ChannelRegistry::new();
        let mut rx = local_subscriber(&registry, "general");
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            registry,
            Arc::new(quiet_bus()),
            inbound_rx,
        );

        let remote = RelayEvent::message("general", json!({"n": 1}), InstanceId::from_string("node-b".to_string()));
        assert_eq!(adapter.handle_inbound(&bus_message(&remote)), InboundOutcome::Delivered(1));

        match rx.try_recv().unwrap() {
            Outbound::Event(event) => assert_eq!(event, remote),
            Outbound::Probe => panic!("expected an event"),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_topics_are_discarded() {
        let registry = ChannelRegistry::new();
        let mut rx = local_subscriber(&registry, "general");
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            registry,
            Arc::new(quiet_bus()),
            inbound_rx,
        );

        let garbage = BusMessage {
            topic: topic_for("general"),
            payload: "{not json".to_string(),
        };
        assert_eq!(adapter.handle_inbound(&garbage), InboundOutcome::Malformed);

        let pong = BusMessage {
            topic: topic_for("general"),
            payload: serde_json::to_string(&RelayEvent::pong()).unwrap(),
        };
        assert_eq!(adapter.handle_inbound(&pong), InboundOutcome::Malformed);

        let foreign = BusMessage {
            topic: "elsewhere".to_string(),
            payload: "{}".to_string(),
        };
        assert_eq!(adapter.handle_inbound(&foreign), InboundOutcome::UnknownTopic);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ensure_topic_subscribes_once() {
        let mut bus = MockBus::new();
        bus.expect_name().return_const("mock");
        bus.expect_subscribe()
            .withf(|topic| topic == "relay:ch:general")
            .times(1)
            .returning(|_| Ok(()));

        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            Arc::new(bus),
            inbound_rx,
        );

        assert!(adapter.ensure_topic("general").await);
        assert!(!adapter.ensure_topic("general").await);
        assert!(adapter.is_subscribed("general"));
        assert_eq!(adapter.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_can_be_retried() {
        let mut bus = MockBus::new();
        bus.expect_name().return_const("mock");
        let mut seq = mockall::Sequence::new();
        bus.expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("bus down")));
        bus.expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            Arc::new(bus),
            inbound_rx,
        );

        assert!(!adapter.ensure_topic("general").await);
        assert!(!adapter.is_subscribed("general"));
        assert!(adapter.ensure_topic("general").await);
    }

    /// First subscribe blocks until released and then fails; later ones succeed
    struct GatedBus {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MessageBus for GatedBus {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn publish(&self, _topic: &str, _payload: String) -> anyhow::Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _topic: &str) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
                anyhow::bail!("bus down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_waiter_retries_after_concurrent_subscribe_fails() {
        let bus = Arc::new(GatedBus {
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            bus.clone(),
            inbound_rx,
        );

        let first = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.ensure_topic("general").await }
        });
        bus.entered.notified().await;

        let second = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.ensure_topic("general").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!adapter.is_subscribed("general"));

        bus.release.notify_one();

        assert!(!first.await.unwrap());
        assert!(second.await.unwrap());
        assert!(adapter.is_subscribed("general"));
        assert_eq!(adapter.topic_count(), 1);
        assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted_not_retried() {
        let mut bus = MockBus::new();
        bus.expect_name().return_const("mock");
        bus.expect_publish()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("bus down")));

        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let adapter = BusAdapter::start(
            InstanceId::from_string("node-a".to_string()),
            ChannelRegistry::new(),
            Arc::new(bus),
            inbound_rx,
        );

        let event = RelayEvent::message("general", json!("x"), adapter.identity().clone());
        adapter.forward(&event);

        for _ in 0..50 {
            if adapter.stats().publish_failures == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(adapter.stats().publish_failures, 1);
        assert_eq!(adapter.stats().forwarded, 0);
    }
}
