use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection_manager::ConnectionManager;

/// Periodic liveness sweep over all connections
///
/// A connection that fails to answer two consecutive probes is closed and
/// removed from every channel. The task stops when `cancel` fires.
pub struct Heartbeat {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Heartbeat {
    pub fn spawn(manager: ConnectionManager, period: Duration, cancel: CancellationToken) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval = ?period, "Heartbeat started");

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("Heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let report = manager.sweep();
                        debug!(
                            probed = report.probed,
                            terminated = report.terminated,
                            connections = manager.connection_count(),
                            "Heartbeat tick"
                        );
                    }
                }
            }
        });

        Self { handle, cancel }
    }

    /// Stop the task and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::channel_registry::ChannelRegistry;
    use crate::sync::connection_manager::Liveness;
    use relay_core::models::ConnectionId;
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_terminated_after_two_ticks() {
        let manager = ConnectionManager::new(ChannelRegistry::new(), None);
        let (tx, _rx) = mpsc::channel(8);
        let closer = CancellationToken::new();
        let id = ConnectionId::from("silent");
        manager.register(id.clone(), tx, closer.clone()).unwrap();
        manager
            .subscribe(&id, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let heartbeat = Heartbeat::spawn(manager.clone(), PERIOD, CancellationToken::new());

        tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;
        assert_eq!(manager.liveness(&id), Liveness::Suspect);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(manager.liveness(&id), Liveness::Terminated);
        assert!(closer.is_cancelled());
        assert_eq!(manager.registry().subscriber_count("a"), 0);
        assert_eq!(manager.registry().subscriber_count("b"), 0);

        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_connection_survives() {
        let manager = ConnectionManager::new(ChannelRegistry::new(), None);
        let (tx, mut rx) = mpsc::channel(8);
        let id = ConnectionId::from("chatty");
        manager.register(id.clone(), tx, CancellationToken::new()).unwrap();

        let heartbeat = Heartbeat::spawn(manager.clone(), PERIOD, CancellationToken::new());

        for _ in 0..4 {
            tokio::time::sleep(PERIOD + Duration::from_millis(10)).await;
            // Answer the probe the way the transport would
            while rx.try_recv().is_ok() {
                manager.record_pong(&id);
            }
        }

        assert_eq!(manager.liveness(&id), Liveness::Alive);
        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let manager = ConnectionManager::new(ChannelRegistry::new(), None);
        let cancel = CancellationToken::new();
        let heartbeat = Heartbeat::spawn(manager, PERIOD, cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(heartbeat.is_finished());
    }
}
