pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    BusAdapter, ChannelRegistry, ClientMessage, ConnectionManager, FanoutEngine, Heartbeat,
    LocalBusHub, MessageBus, Outbound, RedisBus, RelayEvent,
};
