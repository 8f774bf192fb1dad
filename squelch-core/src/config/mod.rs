//! Configuration management for Squelch
//!
//! Defaults, TOML files and `SQUELCH_<SECTION>_<KEY>` environment overrides,
//! with validation applied on every load path.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::logging::LogLevel;

const ENV_PREFIX: &str = "SQUELCH";

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Offer/answer exchange tuning
    pub signaling: SignalingConfig,

    /// Channel catalog provisioning
    pub channels: ChannelConfig,

    /// Presence display
    pub presence: PresenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Signaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Capacity of the client command queue
    pub command_buffer: usize,

    /// Attempts for offer and answer publication, first try included
    pub offer_publish_attempts: u32,

    /// Upper bound on the best-effort record cleanup after a transmission
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,

    /// Candidates held per remote participant before its connection exists
    pub max_pending_candidates: usize,
}

/// Channel catalog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Seed the default channel set into an empty directory
    pub seed_defaults: bool,

    /// Number of seeded channels (`01`..)
    pub default_count: u32,

    /// Display name prefix of seeded channels
    pub name_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Member labels shown before truncation
    pub display_limit: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,

    /// Include thread ids
    pub with_thread_ids: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at start-up
    pub enabled: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            command_buffer: 64,
            offer_publish_attempts: 2,
            cleanup_timeout: Duration::from_secs(5),
            max_pending_candidates: 64,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            seed_defaults: true,
            default_count: 25,
            name_prefix: "Channel".to_string(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { display_limit: 10 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::invalid(key, e))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::invalid(key, e))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: SQUELCH_<SECTION>_<KEY>
    /// Example: SQUELCH_SIGNALING_CLEANUP_TIMEOUT=2s
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SQUELCH_*` overrides resolved through `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |section: &str, key: &str| {
            let name = format!("{ENV_PREFIX}_{section}_{key}");
            lookup(&name).map(|value| (name, value))
        };

        // Signaling
        if let Some((k, v)) = var("SIGNALING", "COMMAND_BUFFER") {
            self.signaling.command_buffer = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("SIGNALING", "OFFER_PUBLISH_ATTEMPTS") {
            self.signaling.offer_publish_attempts = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("SIGNALING", "CLEANUP_TIMEOUT") {
            self.signaling.cleanup_timeout = parse_duration(&k, &v)?;
        }
        if let Some((k, v)) = var("SIGNALING", "MAX_PENDING_CANDIDATES") {
            self.signaling.max_pending_candidates = parse(&k, &v)?;
        }

        // Channels
        if let Some((k, v)) = var("CHANNELS", "SEED_DEFAULTS") {
            self.channels.seed_defaults = parse(&k, &v)?;
        }
        if let Some((k, v)) = var("CHANNELS", "DEFAULT_COUNT") {
            self.channels.default_count = parse(&k, &v)?;
        }
        if let Some((_, v)) = var("CHANNELS", "NAME_PREFIX") {
            self.channels.name_prefix = v;
        }

        // Presence
        if let Some((k, v)) = var("PRESENCE", "DISPLAY_LIMIT") {
            self.presence.display_limit = parse(&k, &v)?;
        }

        // Logging
        if let Some((_, v)) = var("LOGGING", "LEVEL") {
            self.logging.level = v;
        }
        if let Some((k, v)) = var("LOGGING", "JSON_FORMAT") {
            self.logging.json_format = parse(&k, &v)?;
        }

        // Metrics
        if let Some((k, v)) = var("METRICS", "ENABLED") {
            self.metrics.enabled = parse(&k, &v)?;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationFailed(msg.to_string()));

        if self.signaling.command_buffer == 0 {
            return fail("command_buffer must be greater than 0");
        }
        if self.signaling.offer_publish_attempts == 0 {
            return fail("offer_publish_attempts must be at least 1");
        }
        if self.signaling.cleanup_timeout.is_zero() {
            return fail("cleanup_timeout must be non-zero");
        }
        if self.signaling.max_pending_candidates == 0 {
            return fail("max_pending_candidates must be greater than 0");
        }

        if !(1..=99).contains(&self.channels.default_count) {
            return fail("default_count must be between 1 and 99");
        }
        if self.channels.name_prefix.trim().is_empty() {
            return fail("name_prefix must not be empty");
        }

        if self.presence.display_limit == 0 {
            return fail("display_limit must be greater than 0");
        }

        if LogLevel::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
