use dashmap::DashMap;
use relay_core::models::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::events::RelayEvent;

/// Items queued for a connection's transport writer
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(RelayEvent),
    /// Transport-level liveness probe (WebSocket ping frame)
    Probe,
}

/// Message sender for a client connection
pub type MessageSender = mpsc::Sender<Outbound>;

/// A channel member as seen by a fan-out snapshot
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub sender: MessageSender,
}

impl Subscriber {
    /// Whether the connection's transport still accepts writes
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Result of a subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadySubscribed,
    /// The connection is not registered (never was, or already closed)
    UnknownConnection,
}

struct ConnectionEntry {
    sender: MessageSender,
    channels: HashSet<String>,
}

/// Channel name -> current subscribers, shared by every task of the process
///
/// Membership is mutated under the connection's entry lock, so a connection
/// that has been removed can never be added back to a channel afterwards.
/// Fan-out iterates an owned snapshot and never holds a map lock while sending.
#[derive(Clone)]
pub struct ChannelRegistry {
    /// Map of channel -> subscribers
    channels: Arc<DashMap<String, HashMap<ConnectionId, MessageSender>>>,

    /// Map of connection -> (sender, channels) for cleanup
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Create the channel's subscriber set if absent
    pub fn ensure(&self, channel: &str) {
        if !self.channels.contains_key(channel) {
            self.channels.entry(channel.to_string()).or_default();
        }
    }

    /// Make a connection known to the registry. Returns false if the id is taken.
    pub fn register(&self, connection_id: ConnectionId, sender: MessageSender) -> bool {
        match self.connections.entry(connection_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    sender,
                    channels: HashSet::new(),
                });
                true
            }
        }
    }

    /// Add a connection to a channel (idempotent)
    pub fn subscribe(&self, channel: &str, connection_id: &ConnectionId) -> SubscribeOutcome {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return SubscribeOutcome::UnknownConnection;
        };

        if !conn.channels.insert(channel.to_string()) {
            return SubscribeOutcome::AlreadySubscribed;
        }

        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id.clone(), conn.sender.clone());

        debug!(
            channel = %channel,
            connection_id = %connection_id,
            "Connection subscribed to channel"
        );

        SubscribeOutcome::Added
    }

    /// Remove a connection from one channel (no-op if absent)
    pub fn unsubscribe(&self, channel: &str, connection_id: &ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.channels.remove(channel);
        }
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(connection_id);
        }
    }

    /// Forget a connection and remove it from every channel it joined.
    ///
    /// Returns the channels it left; empty if the connection was unknown.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Vec<String> {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return Vec::new();
        };

        let mut left: Vec<String> = entry.channels.into_iter().collect();
        for channel in &left {
            if let Some(mut members) = self.channels.get_mut(channel) {
                members.remove(connection_id);
            }
        }
        left.sort();

        info!(
            connection_id = %connection_id,
            channels = left.len(),
            "Connection removed from registry"
        );

        left
    }

    /// Snapshot of a channel's current subscribers
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<Subscriber> {
        self.channels
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .map(|(connection_id, sender)| Subscriber {
                        connection_id: connection_id.clone(),
                        sender: sender.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver an event to every subscriber in a snapshot of the channel.
    ///
    /// Send failures are per connection and ignored: a full or closed queue
    /// counts as a non-delivery and the connection is left in place. Returns
    /// the number of successful sends.
    pub fn broadcast(&self, channel: &str, event: &RelayEvent) -> usize {
        let mut sent_count = 0;

        for subscriber in self.members(channel) {
            if !subscriber.is_writable() {
                continue;
            }
            match subscriber.sender.try_send(Outbound::Event(event.clone())) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    debug!(
                        channel = %channel,
                        connection_id = %subscriber.connection_id,
                        error = %err,
                        "Dropped event for connection"
                    );
                }
            }
        }

        sent_count
    }

    /// Channels a connection currently belongs to
    #[must_use]
    pub fn channels_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .connections
            .get(connection_id)
            .map(|conn| conn.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Get the number of subscribers in a channel
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |members| members.len())
    }

    /// Per-channel subscriber counts, sorted by channel name
    #[must_use]
    pub fn channel_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        counts.sort_by(|a, b| a.0.cmp(&b.0));
        counts
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Get total number of registered connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
