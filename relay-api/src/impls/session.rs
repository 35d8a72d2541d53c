//! Per-connection client session
//!
//! A duplex transport adapts itself to [`ClientStream`] and hands frames to
//! [`ClientSession::run`], which owns the protocol: subscribe requests,
//! application-level ping/pong and transport-level liveness acknowledgments.

use async_trait::async_trait;
use relay_cluster::sync::{ClientMessage, ConnectionManager, MessageSender, Outbound, RelayEvent};
use relay_core::models::ConnectionId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A frame received from a client transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame carrying a JSON request
    Text(String),
    /// Transport-level acknowledgment of a liveness probe
    Pong,
    /// Anything else (binary, transport ping); ignored
    Other,
}

/// Transport-agnostic receiving half of a client connection
#[async_trait]
pub trait ClientStream: Send {
    /// Receive the next frame
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<Result<Inbound, String>>;
}

/// One client connection's protocol state
///
/// Replies are written to the connection's outbound queue, the same queue
/// channel messages are fanned out to, so a client sees them in order.
pub struct ClientSession {
    connection_id: ConnectionId,
    connections: ConnectionManager,
    sender: MessageSender,
    closer: CancellationToken,
}

impl ClientSession {
    /// Register the connection and start its session
    pub fn open(
        connection_id: ConnectionId,
        connections: ConnectionManager,
        sender: MessageSender,
        closer: CancellationToken,
    ) -> relay_cluster::Result<Self> {
        connections.register(connection_id.clone(), sender.clone(), closer.clone())?;

        Ok(Self {
            connection_id,
            connections,
            sender,
            closer,
        })
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Run the receive loop until the client leaves or the connection is
    /// closed by the relay, then unregister it.
    pub async fn run<S: ClientStream>(&self, stream: &mut S) {
        loop {
            tokio::select! {
                () = self.closer.cancelled() => {
                    debug!(connection_id = %self.connection_id, "Session closed by relay");
                    break;
                }

                frame = stream.recv() => {
                    match frame {
                        Some(Ok(frame)) => self.handle_frame(frame).await,
                        Some(Err(e)) => {
                            warn!(connection_id = %self.connection_id, error = %e, "Transport error");
                            break;
                        }
                        None => {
                            info!(connection_id = %self.connection_id, "Client disconnected");
                            break;
                        }
                    }
                }
            }
        }

        self.connections.disconnect(&self.connection_id);
    }

    /// Handle a single inbound frame. Malformed requests are dropped.
    pub async fn handle_frame(&self, frame: Inbound) {
        match frame {
            Inbound::Pong => self.connections.record_pong(&self.connection_id),
            Inbound::Other => {}
            Inbound::Text(text) => {
                self.connections.record_message(&self.connection_id);

                let Some(message) = ClientMessage::parse(&text) else {
                    debug!(connection_id = %self.connection_id, "Ignoring malformed client message");
                    return;
                };

                match message {
                    ClientMessage::Subscribe { channels } => {
                        match self.connections.subscribe(&self.connection_id, &channels).await {
                            Ok(channels) => self.reply(RelayEvent::Subscribed { channels }),
                            Err(e) => debug!(connection_id = %self.connection_id, error = %e, "Subscribe rejected"),
                        }
                    }
                    ClientMessage::Ping => self.reply(RelayEvent::pong()),
                }
            }
        }
    }

    fn reply(&self, event: RelayEvent) {
        if let Err(e) = self.sender.try_send(Outbound::Event(event)) {
            debug!(connection_id = %self.connection_id, error = %e, "Dropped reply");
        }
    }
}
