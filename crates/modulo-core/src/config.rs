/*!
 * Configuration management for Modulo.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the bus layer and the host loop.
 */
use std::path::{Path, PathBuf};

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Modulo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bus protocol configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Host main loop configuration
    #[serde(default)]
    pub host: HostConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Bus protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Minimum time since process start before the first bus call, in milliseconds
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    /// Seed for the address counter; the first synthesized address is `seed + 1`
    #[serde(default = "default_address_seed")]
    pub address_seed: u8,

    /// Number of bus attempts a transfer makes before giving up
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u8,

    /// Longest device type string read from a device
    #[serde(default = "default_device_type_max_len")]
    pub device_type_max_len: usize,

    /// Maximum number of events drained per call to the event pump
    #[serde(default = "default_event_poll_limit")]
    pub event_poll_limit: usize,
}

/// Host main loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Period of the main loop in milliseconds
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Stop after this many iterations (0 runs until interrupted)
    #[serde(default)]
    pub max_ticks: u64,

    /// Simulated bus topology file
    #[serde(default)]
    pub topology: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            warmup_ms: default_warmup_ms(),
            address_seed: default_address_seed(),
            transfer_attempts: default_transfer_attempts(),
            device_type_max_len: default_device_type_max_len(),
            event_poll_limit: default_event_poll_limit(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: default_loop_interval_ms(),
            max_ticks: 0,
            topology: None,
        }
    }
}

impl Config {
    /// Check that the values can drive the bus layer
    pub fn validate(&self) -> Result<()> {
        if self.bus.transfer_attempts == 0 {
            return Err(Error::validation("bus.transfer_attempts must be at least 1"));
        }
        if self.bus.address_seed >= 0xFE {
            return Err(Error::validation(format!(
                "bus.address_seed {} leaves no assignable addresses",
                self.bus.address_seed
            )));
        }
        if self.bus.device_type_max_len == 0 {
            return Err(Error::validation("bus.device_type_max_len must be non-zero"));
        }
        if self.host.loop_interval_ms == 0 {
            return Err(Error::validation("host.loop_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "modulo".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_warmup_ms() -> u64 {
    100
}

fn default_address_seed() -> u8 {
    9
}

fn default_transfer_attempts() -> u8 {
    3
}

fn default_device_type_max_len() -> usize {
    31
}

fn default_event_poll_limit() -> usize {
    16
}

fn default_loop_interval_ms() -> u64 {
    10
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let mut config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}
