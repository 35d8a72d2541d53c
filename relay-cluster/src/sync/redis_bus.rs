use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use futures::stream::StreamExt;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{BusMessage, MessageBus};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

struct SubscribeCommand {
    topic: String,
    ack: oneshot::Sender<Result<()>>,
}

/// Redis Pub/Sub transport
///
/// Publishing goes through a lazily created auto-reconnecting connection.
/// Receiving runs in a dedicated task that owns a Pub/Sub connection and
/// reconnects with exponential backoff, re-subscribing every topic it has
/// been asked for. Messages are forwarded to the inbound queue handed to
/// [`RedisBus::start`]; a full queue drops the message.
pub struct RedisBus {
    redis_client: RedisClient,
    publisher: OnceCell<RedisConnectionManager>,
    /// Every topic ever requested; restored after reconnect
    topics: Arc<DashSet<String>>,
    command_tx: mpsc::UnboundedSender<SubscribeCommand>,
    cancel_token: CancellationToken,
}

impl RedisBus {
    /// Connect to Redis and spawn the subscriber task
    pub fn start(
        redis_url: &str,
        inbound_tx: mpsc::Sender<BusMessage>,
        cancel_token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;
        let topics = Arc::new(DashSet::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_subscriber_loop(
            redis_client.clone(),
            topics.clone(),
            command_rx,
            inbound_tx,
            cancel_token.clone(),
        ));

        info!("Redis bus started");

        Ok(Arc::new(Self {
            redis_client,
            publisher: OnceCell::new(),
            topics,
            command_tx,
            cancel_token,
        }))
    }

    /// Check the server is reachable
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.publisher().await?;
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .context("Timed out pinging Redis")?
        .context("Failed to ping Redis")?;
        Ok(())
    }

    /// Stop the subscriber task
    pub fn shutdown(&self) {
        info!("Shutting down Redis bus");
        self.cancel_token.cancel();
    }

    async fn publisher(&self) -> Result<RedisConnectionManager> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    self.redis_client.get_connection_manager(),
                )
                .await
                .context("Timed out connecting to Redis")?
                .context("Failed to connect to Redis")
            })
            .await?;
        Ok(conn.clone())
    }

    async fn run_subscriber_loop(
        client: RedisClient,
        topics: Arc<DashSet<String>>,
        mut command_rx: mpsc::UnboundedReceiver<SubscribeCommand>,
        inbound_tx: mpsc::Sender<BusMessage>,
        cancel: CancellationToken,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if cancel.is_cancelled() {
                info!("Redis subscriber task cancelled");
                return;
            }

            match Self::run_subscriber(&client, &topics, &mut command_rx, &inbound_tx, &cancel).await {
                SubscriberExit::Cancelled => {
                    info!("Redis subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    error!(
                        "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Redis subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Redis subscriber task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_subscriber(
        client: &RedisClient,
        topics: &DashSet<String>,
        command_rx: &mut mpsc::UnboundedReceiver<SubscribeCommand>,
        inbound_tx: &mpsc::Sender<BusMessage>,
        cancel: &CancellationToken,
    ) -> SubscriberExit {
        let pubsub = match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        let (mut sink, mut stream) = pubsub.split();

        let known: Vec<String> = topics.iter().map(|t| t.key().clone()).collect();
        for topic in &known {
            match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), sink.subscribe(topic)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return SubscriberExit::ConnectFailed(
                        anyhow::anyhow!(e).context(format!("Failed to resubscribe to {topic}")),
                    );
                }
                Err(_) => {
                    return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                        "Timed out resubscribing to {topic}"
                    ));
                }
            }
        }

        info!(topics = known.len(), "Redis subscriber connected");

        loop {
            tokio::select! {
                () = cancel.cancelled() => return SubscriberExit::Cancelled,

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        return SubscriberExit::Cancelled;
                    };
                    let result = timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), sink.subscribe(&command.topic))
                        .await
                        .context("Timed out subscribing to Redis channel")
                        .and_then(|r| r.context("Failed to subscribe to Redis channel"));
                    let failed = result.is_err();
                    let _ = command.ack.send(result);
                    if failed {
                        // The topic stays known and is restored on reconnect
                        return SubscriberExit::Disconnected;
                    }
                    debug!(topic = %command.topic, "Subscribed to Redis channel");
                }

                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return SubscriberExit::Disconnected;
                    };

                    let topic = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, channel = %topic, "Invalid payload");
                            continue;
                        }
                    };

                    if let Err(e) = inbound_tx.try_send(BusMessage { topic, payload }) {
                        warn!(error = %e, "Bus inbound queue rejected message");
                        if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                            return SubscriberExit::Cancelled;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher().await?;
        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(topic, payload),
        )
        .await
        .context("Timed out publishing to Redis")?
        .context("Failed to publish to Redis")?;

        debug!(topic = %topic, receivers = receivers, "Event published to Redis");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.topics.insert(topic.to_string()) {
            return Ok(());
        }

        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(SubscribeCommand {
                topic: topic.to_string(),
                ack,
            })
            .map_err(|_| anyhow::anyhow!("Redis subscriber task stopped"))?;

        match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow::anyhow!("Redis subscriber dropped the request")),
            // Still queued behind a reconnect; it is subscribed once the connection is back
            Err(_) => {
                warn!(topic = %topic, "Redis subscribe pending reconnect");
                Ok(())
            }
        }
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// How the subscriber loop exited
enum SubscriberExit {
    /// Shutdown requested or the inbound side went away
    Cancelled,
    /// Connection was healthy and then dropped; backoff resets
    Disconnected,
    /// Could not connect or restore subscriptions; backoff keeps growing
    ConnectFailed(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::bus::topic_for;

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let result = RedisBus::start("not a url", tx, CancellationToken::new());
        assert!(result.is_err());
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_pubsub_integration() {
        let redis_url = "redis://127.0.0.1:6379";
        let cancel = CancellationToken::new();

        let (tx1, _rx1) = mpsc::channel(64);
        let (tx2, mut rx2) = mpsc::channel(64);
        let bus1 = RedisBus::start(redis_url, tx1, cancel.clone()).unwrap();
        let bus2 = RedisBus::start(redis_url, tx2, cancel.clone()).unwrap();

        let topic = topic_for("integration");
        bus2.subscribe(&topic).await.unwrap();
        bus1.ping().await.unwrap();

        // Wait for the subscription to settle
        tokio::time::sleep(Duration::from_millis(500)).await;

        bus1.publish(&topic, "hello".to_string()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic, topic);
        assert_eq!(received.payload, "hello");

        cancel.cancel();
    }
}
