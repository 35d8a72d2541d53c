use chrono::{DateTime, Utc};
use relay_core::models::InstanceId;
use serde::{Deserialize, Serialize};

/// Events sent from the relay to connected clients and across the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A payload published to a channel
    Message {
        channel: String,
        payload: serde_json::Value,
        /// Instance that accepted the publish
        #[serde(rename = "originInstance")]
        origin: InstanceId,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    /// Acknowledges a subscribe request with the channels actually joined
    Subscribed { channels: Vec<String> },

    Ping,

    /// Reply to a client ping
    Pong {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl RelayEvent {
    /// Build a message event stamped with `origin` and the current time
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: serde_json::Value, origin: InstanceId) -> Self {
        Self::Message {
            channel: channel.into(),
            payload,
            origin,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// Get the event type as a string
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Subscribed { .. } => "subscribed",
            Self::Ping => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Channel of a message event
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Message { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Origin instance of a message event
    #[must_use]
    pub const fn origin(&self) -> Option<&InstanceId> {
        match self {
            Self::Message { origin, .. } => Some(origin),
            _ => None,
        }
    }
}

/// Requests a client may send over its duplex connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Ping,
}

impl ClientMessage {
    /// Parse a text frame; anything that is not a known request yields `None`
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
