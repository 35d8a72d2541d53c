use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
///
/// Every field can be set from the environment with the `RELAY_` prefix
/// (`RELAY_PORT`, `RELAY_MAX_HISTORY`, ...). Nested sections use a double
/// underscore (`RELAY_LOGGING__LEVEL`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Per-channel capacity of the in-memory history buffer
    pub max_history: usize,
    /// PostgreSQL URL for durable history. Unset means in-memory history.
    pub database_url: Option<String>,
    /// Redis URL for cross-instance fan-out. Unset means single-instance mode.
    pub redis_url: Option<String>,
    /// Allowed CORS origin for the HTTP API (`*` allows any)
    pub cors_origin: String,
    pub heartbeat_interval_secs: u64,
    /// Outbound queue depth per WebSocket connection
    pub outbound_buffer: usize,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_history: 50,
            database_url: None,
            redis_url: None,
            cors_origin: "*".to_string(),
            heartbeat_interval_secs: 30,
            outbound_buffer: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port must be greater than 0".to_string());
        }
        if self.max_history == 0 {
            errors.push("max_history must be greater than 0".to_string());
        }
        if self.heartbeat_interval_secs == 0 {
            errors.push("heartbeat_interval_secs must be greater than 0".to_string());
        }
        if self.outbound_buffer == 0 {
            errors.push("outbound_buffer must be greater than 0".to_string());
        }
        if let Some(url) = self.database_url() {
            if let Err(e) = check_scheme(url, &["postgres", "postgresql"]) {
                errors.push(format!("database_url: {e}"));
            }
        }
        if let Some(url) = self.redis_url() {
            if let Err(e) = check_scheme(url, &["redis", "rediss"]) {
                errors.push(format!("redis_url: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Durable store URL, treating an empty string as unset
    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref().filter(|url| !url.is_empty())
    }

    /// Bus URL, treating an empty string as unset
    #[must_use]
    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref().filter(|url| !url.is_empty())
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn check_scheme(raw: &str, allowed: &[&str]) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL ({e})"))?;
    if allowed.contains(&parsed.scheme()) {
        Ok(())
    } else {
        Err(format!(
            "unsupported scheme '{}', expected one of {}",
            parsed.scheme(),
            allowed.join(", ")
        ))
    }
}
