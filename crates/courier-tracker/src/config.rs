//! Configuration management for courier-tracker.
//!
//! Configuration is loaded with figment from defaults, an optional TOML file
//! and `COURIER_TRACKER_` environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::channel::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::source::{GpsdSource, LocationSource, ReplaySource, UpdateOptions};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "courier-tracker";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "tracking.db";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "COURIER_TRACKER_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (`COURIER_TRACKER_CHANNEL__URL=...`)
/// 2. TOML config file at `~/.config/courier-tracker/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event channel configuration.
    pub channel: ChannelConfig,
    /// Delivery API configuration.
    pub api: ApiConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Location source configuration.
    pub location: LocationConfig,
}

/// Event channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// WebSocket endpoint of the tracking server.
    pub url: String,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Upper bound of the reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,
    /// Outbound events queued before emits report the channel full.
    pub outbound_buffer: usize,
}

/// Delivery API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL; status is read from `{base_url}/deliveries/{id}`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/courier-tracker/tracking.db`
    pub database_path: Option<PathBuf>,
}

/// Location source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// `gpsd` or `replay`.
    pub source: String,
    /// gpsd daemon address.
    pub gpsd_addr: String,
    /// Recording replayed by the `replay` source.
    pub replay_path: Option<PathBuf>,
    /// Fixes per replayed batch.
    pub batch_size: usize,
    /// Seconds between fix batches.
    pub deferred_interval_secs: u64,
    /// Minimum movement in metres between accepted fixes.
    pub distance_interval_m: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/tracking".to_string(),
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            outbound_buffer: 64,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            source: "gpsd".to_string(),
            gpsd_addr: crate::source::gpsd::DEFAULT_GPSD_ADDR.to_string(),
            replay_path: None,
            batch_size: 5,
            deferred_interval_secs: 30,
            distance_interval_m: 0.0,
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config = Self::figment(config_path).extract::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered figment without extraction or validation.
    #[must_use]
    pub fn figment(config_path: Option<PathBuf>) -> Figment {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let channel_url = self.channel_url()?;
        if !matches!(channel_url.scheme(), "ws" | "wss") {
            return Err(invalid(format!(
                "channel.url must use ws or wss, got {}",
                channel_url.scheme()
            )));
        }
        if self.channel.reconnect_initial_ms == 0 {
            return Err(invalid("channel.reconnect_initial_ms must be greater than 0"));
        }
        if self.channel.reconnect_max_ms < self.channel.reconnect_initial_ms {
            return Err(invalid(format!(
                "channel.reconnect_max_ms ({}) cannot be less than reconnect_initial_ms ({})",
                self.channel.reconnect_max_ms, self.channel.reconnect_initial_ms
            )));
        }
        if self.channel.outbound_buffer == 0 {
            return Err(invalid("channel.outbound_buffer must be greater than 0"));
        }

        let api_url = self.api_base_url()?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "api.base_url must use http or https, got {}",
                api_url.scheme()
            )));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(invalid("api.request_timeout_secs must be greater than 0"));
        }

        let location = &self.location;
        match location.source.as_str() {
            "gpsd" => {}
            "replay" => {
                if location.replay_path.is_none() {
                    return Err(invalid("location.replay_path is required for the replay source"));
                }
            }
            other => {
                return Err(invalid(format!(
                    "unknown location.source {other:?}, expected gpsd or replay"
                )))
            }
        }
        if location.batch_size == 0 {
            return Err(invalid("location.batch_size must be greater than 0"));
        }
        if location.deferred_interval_secs == 0 {
            return Err(invalid("location.deferred_interval_secs must be greater than 0"));
        }
        if !location.distance_interval_m.is_finite() || location.distance_interval_m < 0.0 {
            return Err(invalid("location.distance_interval_m must be a non-negative number"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Parsed event channel URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `channel.url` does not parse.
    pub fn channel_url(&self) -> Result<Url> {
        Url::parse(&self.channel.url)
            .map_err(|e| invalid(format!("channel.url {:?}: {e}", self.channel.url)))
    }

    /// Parsed delivery API base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `api.base_url` does not parse.
    pub fn api_base_url(&self) -> Result<Url> {
        Url::parse(&self.api.base_url)
            .map_err(|e| invalid(format!("api.base_url {:?}: {e}", self.api.base_url)))
    }

    /// Reconnect backoff bounds.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.channel.reconnect_initial_ms),
            max: Duration::from_millis(self.channel.reconnect_max_ms),
        }
    }

    /// Status request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    /// Fix cadence requested from the location source.
    #[must_use]
    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            deferred_interval: Duration::from_secs(self.location.deferred_interval_secs),
            distance_interval_m: self.location.distance_interval_m,
        }
    }

    /// Build the configured location source.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown source kind or a replay source
    /// without a recording.
    pub fn location_source(&self) -> Result<Arc<dyn LocationSource>> {
        match self.location.source.as_str() {
            "gpsd" => Ok(Arc::new(GpsdSource::new(
                self.location.gpsd_addr.clone(),
                Duration::from_secs(5),
            ))),
            "replay" => {
                let path = self
                    .location
                    .replay_path
                    .clone()
                    .ok_or_else(|| invalid("location.replay_path is required for the replay source"))?;
                Ok(Arc::new(ReplaySource::new(path, self.location.batch_size)))
            }
            other => Err(invalid(format!("unknown location.source {other:?}"))),
        }
    }
}
