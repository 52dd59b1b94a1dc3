//! Application configuration.
//!
//! Aggregates configuration for the messaging backbone into a single
//! `Config` struct that can be loaded from YAML files or environment
//! variables.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::MessagingConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LEARNSPHERE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LEARNSPHERE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LEARNSPHERE_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging configuration (bus backend, consumer ack policy).
    pub messaging: MessagingConfig,
    /// Realtime WebSocket endpoint configuration.
    pub realtime: RealtimeConfig,
}

impl Config {
    /// Load configuration from files and the environment.
    ///
    /// Sources are layered, later ones overriding earlier ones:
    /// 1. `config.yaml` in the working directory, when present
    /// 2. The file named by the `path` argument, when given
    /// 3. The file named by [`CONFIG_ENV_VAR`], when set
    /// 4. Environment variables carrying the [`CONFIG_ENV_PREFIX`] prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        // Explicit path argument
        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        // Path taken from the environment
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            // Environment variables with CONFIG_ENV_PREFIX prefix, e.g.
            // LEARNSPHERE__MESSAGING__AMQP__URL
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Realtime WebSocket endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Address the WebSocket endpoint binds.
    pub bind_addr: String,
    /// Seconds between protocol-level pings on idle connections.
    pub heartbeat_secs: u64,
    /// Frames buffered per connection before a client counts as slow.
    pub outbound_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_secs: 30,
            outbound_capacity: 32,
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}
