use dashmap::DashMap;
use relay_core::models::ConnectionId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::topic_for;
use super::bus_adapter::BusAdapter;
use super::channel_registry::{ChannelRegistry, MessageSender, Outbound, SubscribeOutcome};
use crate::{Error, Result};

/// Heartbeat state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Probed and waiting for the transport-level pong
    Suspect,
    Terminated,
}

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub liveness: Liveness,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    /// Bus topics this connection caused the process to subscribe to
    pub bus_topics: HashSet<String>,
    sender: MessageSender,
    closer: CancellationToken,
}

impl ConnectionInfo {
    fn new(connection_id: ConnectionId, sender: MessageSender, closer: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            liveness: Liveness::Alive,
            connected_at: now,
            last_activity: now,
            message_count: 0,
            bus_topics: HashSet::new(),
            sender,
            closer,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections moved from `Alive` to `Suspect` and sent a probe
    pub probed: usize,
    /// Suspect connections that missed the probe and were closed
    pub terminated: usize,
}

/// Tracks live duplex connections, their subscriptions and liveness
#[derive(Clone)]
pub struct ConnectionManager {
    /// All active connections by `connection_id`
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,

    registry: ChannelRegistry,

    /// Set when cross-instance delivery is enabled
    bus: Option<Arc<BusAdapter>>,

    /// Metrics
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
    heartbeat_terminations: Arc<AtomicU64>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(registry: ChannelRegistry, bus: Option<Arc<BusAdapter>>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            registry,
            bus,
            total_connections: Arc::new(AtomicU64::new(0)),
            total_messages: Arc::new(AtomicU64::new(0)),
            heartbeat_terminations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a newly accepted transport.
    ///
    /// `sender` feeds the transport's writer; cancelling `closer` must close
    /// the transport.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        sender: MessageSender,
        closer: CancellationToken,
    ) -> Result<()> {
        if self.connections.contains_key(&connection_id)
            || !self.registry.register(connection_id.clone(), sender.clone())
        {
            return Err(Error::DuplicateConnection(connection_id.to_string()));
        }

        self.connections.insert(
            connection_id.clone(),
            ConnectionInfo::new(connection_id.clone(), sender, closer),
        );
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection_id,
            total_connections = self.connections.len(),
            "Connection registered"
        );

        Ok(())
    }

    /// Subscribe a connection to each named channel.
    ///
    /// Blank names and repeats are dropped. Returns the accepted channel
    /// names in request order; re-subscribing to a joined channel still
    /// counts as accepted.
    pub async fn subscribe(&self, connection_id: &ConnectionId, channels: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for name in channels {
            if name.trim().is_empty() || !seen.insert(name.as_str()) {
                continue;
            }

            self.registry.ensure(name);
            match self.registry.subscribe(name, connection_id) {
                SubscribeOutcome::Added | SubscribeOutcome::AlreadySubscribed => {
                    accepted.push(name.clone());
                }
                SubscribeOutcome::UnknownConnection => {
                    return Err(Error::UnknownConnection(connection_id.to_string()));
                }
            }
        }

        if let Some(bus) = &self.bus {
            for name in &accepted {
                let topic = topic_for(name);
                let known = self
                    .connections
                    .get(connection_id)
                    .is_some_and(|conn| conn.bus_topics.contains(&topic));
                if known {
                    continue;
                }

                if bus.ensure_topic(name).await {
                    if let Some(mut conn) = self.connections.get_mut(connection_id) {
                        conn.bus_topics.insert(topic);
                    }
                }
            }
        }

        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_activity = Instant::now();
        }

        debug!(
            connection_id = %connection_id,
            channels = ?accepted,
            "Connection subscribed"
        );

        Ok(accepted)
    }

    /// Transport-level pong received: the connection is alive again
    pub fn record_pong(&self, connection_id: &ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.liveness = Liveness::Alive;
            conn.last_activity = Instant::now();
        }
    }

    /// Record message activity for a connection
    pub fn record_message(&self, connection_id: &ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_activity = Instant::now();
            conn.message_count += 1;
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Close a connection and remove it from every channel.
    ///
    /// Safe to call more than once; returns false if it was already gone.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, conn_info)) = self.connections.remove(connection_id) else {
            return false;
        };

        conn_info.closer.cancel();
        let channels = self.registry.remove_connection(connection_id);

        info!(
            connection_id = %connection_id,
            duration = ?conn_info.duration(),
            message_count = conn_info.message_count,
            channels = channels.len(),
            "Connection unregistered"
        );

        true
    }

    /// Close every open connection. Used during shutdown.
    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter(|id| self.disconnect(id)).count()
    }

    /// One heartbeat tick.
    ///
    /// Suspect connections are terminated; alive ones become suspect and are
    /// sent a probe. Terminations run after the scan so no map shard is held
    /// while the registry is updated.
    pub fn sweep(&self) -> HeartbeatReport {
        let mut to_terminate = Vec::new();
        let mut probed = 0;

        for mut entry in self.connections.iter_mut() {
            match entry.liveness {
                Liveness::Suspect => to_terminate.push(entry.key().clone()),
                Liveness::Alive => {
                    entry.liveness = Liveness::Suspect;
                    if entry.sender.try_send(Outbound::Probe).is_ok() {
                        probed += 1;
                    } else {
                        debug!(connection_id = %entry.key(), "Failed to enqueue liveness probe");
                    }
                }
                Liveness::Terminated => {}
            }
        }

        let mut terminated = 0;
        for connection_id in &to_terminate {
            if let Some(mut conn) = self.connections.get_mut(connection_id) {
                conn.liveness = Liveness::Terminated;
            }
            if self.disconnect(connection_id) {
                warn!(connection_id = %connection_id, "Connection missed heartbeat, terminated");
                terminated += 1;
            }
        }

        self.heartbeat_terminations
            .fetch_add(terminated as u64, Ordering::Relaxed);

        HeartbeatReport { probed, terminated }
    }

    /// Current heartbeat state; unknown connections report `Terminated`
    #[must_use]
    pub fn liveness(&self, connection_id: &ConnectionId) -> Liveness {
        self.connections
            .get(connection_id)
            .map_or(Liveness::Terminated, |conn| conn.liveness)
    }

    /// Get connection info
    #[must_use]
    pub fn get_connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// Get connection count
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub const fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Get metrics summary
    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.connection_count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            heartbeat_terminations: self.heartbeat_terminations.load(Ordering::Relaxed),
        }
    }
}

/// Connection metrics
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_messages: u64,
    pub heartbeat_terminations: u64,
}
