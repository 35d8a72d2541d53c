//! WebSocket transport for the duplex client protocol
//!
//! Adapts axum's `WebSocket` to the transport-agnostic [`ClientStream`] so
//! all protocol handling lives in [`ClientSession`]. A writer task drains the
//! connection's outbound queue: events become JSON text frames and liveness
//! probes become WebSocket ping frames.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_cluster::sync::Outbound;
use relay_core::models::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::impls::{ClientSession, ClientStream, Inbound};

/// Largest accepted client frame
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// WebSocket stream implementation of `ClientStream`
struct WebSocketStream<R> {
    receiver: R,
}

#[async_trait::async_trait]
impl<R> ClientStream for WebSocketStream<R>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<Inbound, String>> {
        match self.receiver.next().await {
            Some(Ok(Message::Text(text))) => Some(Ok(Inbound::Text(text.as_str().to_string()))),
            Some(Ok(Message::Pong(_))) => Some(Ok(Inbound::Pong)),
            Some(Ok(Message::Close(_))) | None => None,
            Some(Ok(Message::Binary(_) | Message::Ping(_))) => Some(Ok(Inbound::Other)),
            Some(Err(e)) => Some(Err(format!("WebSocket error: {e}"))),
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (tx, rx) = mpsc::channel::<Outbound>(state.config.outbound_buffer);
    let closer = CancellationToken::new();

    let session = match ClientSession::open(connection_id.clone(), state.connections.clone(), tx, closer.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "Failed to register WebSocket connection");
            return;
        }
    };

    info!(connection_id = %connection_id, "WebSocket connection established");

    let (sink, receiver) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, closer.clone(), connection_id.clone()));

    let mut stream = WebSocketStream { receiver };
    session.run(&mut stream).await;

    closer.cancel();
    let _ = writer.await;

    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Drain the outbound queue into the socket until the connection is closed
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    closer: CancellationToken,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let item = tokio::select! {
            () = closer.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            item = rx.recv() => item,
        };

        let Some(item) = item else {
            break;
        };

        let frame = match item {
            Outbound::Event(event) => match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Failed to encode event");
                    continue;
                }
            },
            Outbound::Probe => Message::Ping(Bytes::new()),
        };

        if let Err(e) = sink.send(frame).await {
            debug!(connection_id = %connection_id, error = %e, "Failed to send WebSocket message");
            // Wakes the session loop, which unregisters the connection
            closer.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as frames;
    use relay_cluster::sync::RelayEvent;

    fn id() -> ConnectionId {
        ConnectionId::from("ws-test")
    }

    #[tokio::test]
    async fn test_events_become_text_and_probes_become_pings() {
        let (sink, received) = frames::channel::<Message>(16);
        let (tx, rx) = mpsc::channel(16);
        let closer = CancellationToken::new();

        tx.send(Outbound::Event(RelayEvent::pong())).await.unwrap();
        tx.send(Outbound::Probe).await.unwrap();
        drop(tx);

        write_loop(sink, rx, closer.clone(), id()).await;
        let sent: Vec<Message> = received.collect().await;

        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Message::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(json["type"], "pong");
                assert!(json["timestamp"].is_i64());
            }
            other => panic!("expected a text frame, got {other:?}"),
        }
        assert!(matches!(&sent[1], Message::Ping(payload) if payload.is_empty()));
        assert!(!closer.is_cancelled());
    }

    #[tokio::test]
    async fn test_closing_sends_close_frame() {
        let (sink, received) = frames::channel::<Message>(16);
        let (_tx, rx) = mpsc::channel::<Outbound>(16);
        let closer = CancellationToken::new();
        closer.cancel();

        write_loop(sink, rx, closer, id()).await;
        let sent: Vec<Message> = received.collect().await;

        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Message::Close(None)));
    }

    #[tokio::test]
    async fn test_send_failure_closes_connection() {
        let (sink, received) = frames::channel::<Message>(16);
        drop(received);
        let (tx, rx) = mpsc::channel(16);
        let closer = CancellationToken::new();

        tx.send(Outbound::Probe).await.unwrap();
        write_loop(sink, rx, closer.clone(), id()).await;

        assert!(closer.is_cancelled());
    }

    #[tokio::test]
    async fn test_frames_map_to_inbound() {
        let frames = vec![
            Ok(Message::Text("{\"type\":\"ping\"}".into())),
            Ok(Message::Pong(Bytes::new())),
            Ok(Message::Binary(Bytes::from_static(b"raw"))),
            Ok(Message::Ping(Bytes::new())),
            Err(axum::Error::new(std::io::Error::other("reset"))),
            Ok(Message::Close(None)),
        ];
        let mut stream = WebSocketStream {
            receiver: futures::stream::iter(frames),
        };

        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            Inbound::Text(r#"{"type":"ping"}"#.to_string())
        );
        assert_eq!(stream.recv().await.unwrap().unwrap(), Inbound::Pong);
        assert_eq!(stream.recv().await.unwrap().unwrap(), Inbound::Other);
        assert_eq!(stream.recv().await.unwrap().unwrap(), Inbound::Other);
        assert!(stream.recv().await.unwrap().is_err());
        assert!(stream.recv().await.is_none());
    }
}
