//! Cross-instance bus transport contract
//!
//! A bus moves opaque text payloads between relay instances on named topics.
//! Every channel maps to exactly one topic; any instance may both publish and
//! subscribe to the same topic, so receivers must deduplicate by origin.

use anyhow::Result;
use async_trait::async_trait;

/// Prefix shared by all channel topics
pub const TOPIC_PREFIX: &str = "relay:ch:";

/// Bus topic carrying a channel's messages
#[must_use]
pub fn topic_for(channel: &str) -> String {
    format!("{TOPIC_PREFIX}{channel}")
}

/// Channel name encoded in a topic, if the topic belongs to the relay
#[must_use]
pub fn channel_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(TOPIC_PREFIX).filter(|c| !c.is_empty())
}

/// A message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Transport used to reach other relay instances
///
/// Inbound messages are not pulled through this trait; each transport hands
/// an `mpsc::Receiver<BusMessage>` to the bus adapter when it is created.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &'static str;

    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Start receiving messages for a topic (idempotent)
    async fn subscribe(&self, topic: &str) -> Result<()>;
}
