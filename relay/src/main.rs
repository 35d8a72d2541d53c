mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_cluster::sync::{BusAdapter, ChannelRegistry, ConnectionManager, FanoutEngine, RedisBus};
use relay_core::{
    bootstrap::{init_history, load_config},
    logging,
    models::InstanceId,
    Config,
};

use server::{RelayServer, Services};

/// Depth of the queue between the Redis subscriber and the bus adapter
const BUS_INBOUND_CAPACITY: usize = 10_000;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Real-time pub/sub relay")]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, env = "RELAY_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    let identity = InstanceId::generate();
    info!(instance_id = %identity, "Relay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. History backends
    let history = init_history(&config).await;

    // 4. Channel registry and optional cross-instance bus
    let registry = ChannelRegistry::new();
    let bus_cancel = CancellationToken::new();
    let (redis_bus, bus_adapter) = init_bus(&config, &identity, &registry, &bus_cancel).await;

    // 5. Fan-out engine and connection manager
    let mut engine = FanoutEngine::new(identity, registry.clone(), history.memory.clone());
    if let Some(store) = history.durable.clone() {
        engine = engine.with_durable(Arc::new(store));
    }
    if let Some(adapter) = &bus_adapter {
        engine = engine.with_bus(adapter.clone());
    }

    info!(backend = engine.history_backend(), "History backend selected");

    let connections = ConnectionManager::new(registry, bus_adapter);

    let services = Services {
        engine: Arc::new(engine),
        connections,
        pool: history.durable.map(|store| store.pool().clone()),
        redis_bus,
    };

    // 6. Serve until a shutdown signal arrives
    let server = RelayServer::new(Arc::new(config), services);
    server.start().await
}

/// Connect the Redis bus when configured
///
/// A Redis URL that cannot be used is logged and the relay continues in
/// single-instance mode. An unreachable server is only warned about because
/// the subscriber keeps reconnecting in the background.
async fn init_bus(
    config: &Config,
    identity: &InstanceId,
    registry: &ChannelRegistry,
    cancel: &CancellationToken,
) -> (Option<Arc<RedisBus>>, Option<Arc<BusAdapter>>) {
    let Some(url) = config.redis_url() else {
        info!("Redis not configured, running in single-instance mode");
        return (None, None);
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(BUS_INBOUND_CAPACITY);
    let bus = match RedisBus::start(url, inbound_tx, cancel.child_token()) {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "Failed to start Redis bus, running in single-instance mode");
            return (None, None);
        }
    };

    if let Err(e) = bus.ping().await {
        warn!(error = %e, "Redis not reachable yet, cross-instance delivery will resume once it is");
    }

    let adapter = BusAdapter::start(identity.clone(), registry.clone(), bus.clone(), inbound_rx);
    info!("Cross-instance bus enabled");

    (Some(bus), Some(adapter))
}
