//! In-process pub/sub core: registry, connections, fan-out and the
//! cross-instance bus

pub mod bus;
pub mod bus_adapter;
pub mod channel_registry;
pub mod connection_manager;
pub mod events;
pub mod fanout;
pub mod heartbeat;
pub mod local_bus;
pub mod redis_bus;

pub use bus::{channel_from_topic, topic_for, BusMessage, MessageBus};
pub use bus_adapter::{BusAdapter, BusStats, InboundOutcome};
pub use channel_registry::{ChannelRegistry, MessageSender, Outbound, SubscribeOutcome, Subscriber};
pub use connection_manager::{ConnectionInfo, ConnectionManager, ConnectionMetrics, HeartbeatReport, Liveness};
pub use events::{ClientMessage, RelayEvent};
pub use fanout::{ChannelStat, FanoutEngine, HistoryQuery, PublishResult, RelayMetrics};
pub use heartbeat::Heartbeat;
pub use local_bus::{LocalBus, LocalBusHub};
pub use redis_bus::RedisBus;
