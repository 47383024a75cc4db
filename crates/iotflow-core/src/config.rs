/*!
 * Configuration management for iotflow.
 *
 * Settings are layered: built-in defaults, then an optional TOML file,
 * then environment variables (`IOTFLOW_TELEMETRY__BATCH_SIZE=50`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::Protocol;
use crate::error::{Error, Result};

/// Environment prefix used by the binary
pub const ENV_PREFIX: &str = "IOTFLOW";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device manager loops
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Command delivery
    #[serde(default)]
    pub commands: CommandConfig,

    /// Device controller and automation
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Telemetry pipeline
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Device manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Seconds between health-check sweeps
    #[serde(default = "default_sixty")]
    pub health_check_interval_secs: u64,

    /// Run discovery loops when the manager starts
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,

    /// Seconds between discovery scans per protocol
    #[serde(default = "default_sixty")]
    pub discovery_interval_secs: u64,

    /// How long a single discovery scan may run
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// Protocols scanned by discovery
    #[serde(default = "default_discovery_protocols")]
    pub discovery_protocols: Vec<Protocol>,

    /// Seconds a cached live state stays fresh
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,

    /// Capacity of the inbound message channel from adapters
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

/// Command delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Response timeout applied when a caller gives none
    #[serde(default = "default_command_timeout")]
    pub default_timeout_secs: u64,

    /// Connect timeout for adapter sessions
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Poll interval of each automation rule loop
    #[serde(default = "default_rule_poll")]
    pub rule_poll_interval_ms: u64,

    /// Tolerance of time-of-day triggers
    #[serde(default = "default_sixty")]
    pub time_trigger_tolerance_secs: u64,

    /// Session transports tried before the direct adapter call, in order
    #[serde(default = "default_preferred_transports")]
    pub preferred_transports: Vec<Protocol>,
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Seconds between periodic flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Buffer length that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum samples held per device+metric buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Seconds between aggregation passes
    #[serde(default = "default_sixty")]
    pub aggregation_interval_secs: u64,

    /// Seconds between retention sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Retention per data tier
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Retention policy, in hours for raw data and days for aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[allow(missing_docs)]
    #[serde(default = "default_raw_hours")]
    pub raw_hours: i64,
    #[allow(missing_docs)]
    #[serde(default = "default_minute_days")]
    pub minute_days: i64,
    #[allow(missing_docs)]
    #[serde(default = "default_five_minute_days")]
    pub five_minute_days: i64,
    #[allow(missing_docs)]
    #[serde(default = "default_hour_days")]
    pub hour_days: i64,
    #[allow(missing_docs)]
    #[serde(default = "default_day_days")]
    pub day_days: i64,
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
            with_target: true,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_sixty(),
            discovery_enabled: true,
            discovery_interval_secs: default_sixty(),
            discovery_timeout_secs: default_discovery_timeout(),
            discovery_protocols: default_discovery_protocols(),
            state_ttl_secs: default_state_ttl(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_command_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rule_poll_interval_ms: default_rule_poll(),
            time_trigger_tolerance_secs: default_sixty(),
            preferred_transports: default_preferred_transports(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            aggregation_interval_secs: default_sixty(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_hours: default_raw_hours(),
            minute_days: default_minute_days(),
            five_minute_days: default_five_minute_days(),
            hour_days: default_hour_days(),
            day_days: default_day_days(),
        }
    }
}

impl ManagerConfig {
    /// Health-check interval as a duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Discovery interval as a duration
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    /// Discovery source timeout as a duration
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }

    /// State cache time-to-live
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

impl CommandConfig {
    /// Default command timeout as a duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ControllerConfig {
    /// Rule poll interval as a duration
    pub fn rule_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rule_poll_interval_ms.max(1))
    }
}

impl TelemetryConfig {
    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Aggregation interval as a duration
    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs.max(1))
    }

    /// Cleanup interval as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.telemetry.batch_size == 0 {
            return Err(Error::config("telemetry.batch_size must be positive"));
        }
        if self.telemetry.buffer_capacity < self.telemetry.batch_size {
            return Err(Error::config(
                "telemetry.buffer_capacity must be at least telemetry.batch_size",
            ));
        }
        if self.manager.inbound_capacity == 0 {
            return Err(Error::config("manager.inbound_capacity must be positive"));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }
}

fn default_app_name() -> String {
    "iotflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sixty() -> u64 {
    60
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_discovery_protocols() -> Vec<Protocol> {
    vec![
        Protocol::Mqtt,
        Protocol::Coap,
        Protocol::Http,
        Protocol::Bluetooth,
        Protocol::Zigbee,
    ]
}

fn default_state_ttl() -> u64 {
    300
}

fn default_inbound_capacity() -> usize {
    1024
}

fn default_command_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_rule_poll() -> u64 {
    1000
}

fn default_preferred_transports() -> Vec<Protocol> {
    vec![Protocol::WebSocket, Protocol::Mqtt]
}

fn default_flush_interval() -> u64 {
    10
}

fn default_batch_size() -> usize {
    100
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_raw_hours() -> i64 {
    24
}

fn default_minute_days() -> i64 {
    7
}

fn default_five_minute_days() -> i64 {
    30
}

fn default_hour_days() -> i64 {
    90
}

fn default_day_days() -> i64 {
    365
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

    /// Use this configuration instead of anything loaded
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!(path = %config_file, "loading configuration file");
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!(path = %config_file, "configuration file missing, using defaults");
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!(prefix = %prefix, "loading configuration from environment");
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("manager.discovery_protocols")
                    .with_list_parse_key("controller.preferred_transports")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
