//! Application configuration.
//!
//! Aggregates the per-module sections into a single [`Config`] loaded from
//! YAML files and `CTRELAY__*` environment variables.

mod messaging;
mod pipeline;

pub use messaging::{AmqpConfig, TlsConfig};
pub use pipeline::{BridgeConfig, ParserConfig, QueueConfig, SourceConfig, SourceType};

use serde::Deserialize;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conntrack-relay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CTRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CTRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CTRELAY_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Debug level unless `CTRELAY_LOG` says otherwise.
    pub verbose: bool,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub parser: ParserConfig,
    pub queue: QueueConfig,
    pub amqp: AmqpConfig,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `conntrack-relay.yaml` in the current directory (if it exists)
    /// 2. File given by `path` (if provided)
    /// 3. File named by `CTRELAY_CONFIG` (if set)
    /// 4. `CTRELAY__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("source.event_types")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.event_filter()?;

        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue.capacity must be greater than zero".to_string(),
            ));
        }
        if self.source.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "source.buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.amqp.exchange.is_empty() {
            return Err(ConfigError::Invalid("amqp.exchange must be set".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
