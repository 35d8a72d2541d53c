use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relay_api::{create_router, AppState};
use relay_cluster::sync::{ConnectionManager, FanoutEngine, Heartbeat, RedisBus};
use relay_core::Config;

/// Long-lived components wired together at startup
pub struct Services {
    pub engine: Arc<FanoutEngine>,
    pub connections: ConnectionManager,
    pub pool: Option<PgPool>,
    pub redis_bus: Option<Arc<RedisBus>>,
}

/// Relay server
///
/// Runs the HTTP/WebSocket listener and the heartbeat until a shutdown
/// signal arrives, then tears everything down in order.
pub struct RelayServer {
    config: Arc<Config>,
    services: Services,
}

impl RelayServer {
    pub const fn new(config: Arc<Config>, services: Services) -> Self {
        Self { config, services }
    }

    pub async fn start(self) -> Result<()> {
        let cancel = CancellationToken::new();

        let heartbeat = Heartbeat::spawn(
            self.services.connections.clone(),
            self.config.heartbeat_interval(),
            cancel.child_token(),
        );

        let state = AppState {
            engine: self.services.engine.clone(),
            connections: self.services.connections.clone(),
            config: self.config.clone(),
        };
        let router = create_router(state);

        let http_address = self.config.http_address();
        let listener = TcpListener::bind(&http_address)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {http_address}"))?;
        info!("HTTP server listening on {}", http_address);

        // Upgraded WebSocket connections are not tracked by the graceful
        // shutdown, so they are closed explicitly once the signal fires.
        let connections = self.services.connections.clone();
        let graceful = {
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                info!("Shutdown signal received, starting graceful shutdown...");
                cancel.cancel();
                let closed = connections.disconnect_all();
                info!("Closed {} WebSocket connection(s)", closed);
            }
        };

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await;

        match &served {
            Ok(()) => info!("HTTP server shut down gracefully"),
            Err(e) => error!("HTTP server error: {}", e),
        }

        cancel.cancel();
        heartbeat.stop().await;
        self.shutdown().await;

        served.context("HTTP server failed")
    }

    /// Release bus and database resources
    async fn shutdown(&self) {
        info!("Shutting down relay...");

        self.services.engine.shutdown();
        if let Some(bus) = &self.services.redis_bus {
            bus.shutdown();
        }

        if let Some(pool) = &self.services.pool {
            info!("Closing database connection pool...");
            pool.close().await;
            info!("Database pool closed");
        }

        info!("Relay shut down");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
