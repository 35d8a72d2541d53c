//! Configuration loading and history backend selection

use anyhow::Result;
use tracing::{error, info};

use crate::history::{MemoryHistory, PgHistoryStore};
use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. explicit path (`--config` / `RELAY_CONFIG_PATH`)
/// 2. ./relay.yaml (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            let cwd = "relay.yaml";
            std::path::Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        Config::from_env()?
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Selected history backends
///
/// `durable` is set when a database is configured and reachable. `memory` is
/// always present: it is the history when there is no durable store and the
/// fallback when a durable write fails.
pub struct HistoryBackends {
    pub memory: MemoryHistory,
    pub durable: Option<PgHistoryStore>,
}

/// Pick the history backend from configuration
///
/// A database that cannot be reached at startup is logged and the relay
/// continues with in-memory history.
pub async fn init_history(config: &Config) -> HistoryBackends {
    let memory = MemoryHistory::new(config.max_history);

    let durable = match config.database_url() {
        Some(url) => match PgHistoryStore::connect(url).await {
            Ok(store) => {
                info!("PostgreSQL history store connected");
                Some(store)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect history database, using in-memory history");
                None
            }
        },
        None => {
            info!(max_history = config.max_history, "No database configured, using in-memory history");
            None
        }
    };

    HistoryBackends {
        memory,
        durable,
    }
}
