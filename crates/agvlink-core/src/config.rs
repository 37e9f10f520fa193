//! Engine configuration.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. a TOML file (`agvlink.toml`)
//! 3. `AGVLINK_*` environment variables

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{DelimitedMatcher, JsonMatcher, ProtocolMatcher};

/// Default values.
pub mod defaults {
    pub const REQUEST_TIMEOUT_MS: u64 = 3000;
    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_INTERVAL_MS: u64 = 1000;
    pub const RECONNECT_DELAY_MS: u64 = 5000;
    pub const RECONNECT_BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30000;
    pub const MOVE_FLUSH_INTERVAL_MS: u64 = 1000;
    pub const POSITION_COMMAND: &str = "rptpos";
    pub const MOVE_COMMAND: &str = "setrout";
}

/// Environment variable names.
pub mod env_vars {
    pub const REQUEST_TIMEOUT_MS: &str = "AGVLINK_REQUEST_TIMEOUT_MS";
    pub const RETRY_MAX_ATTEMPTS: &str = "AGVLINK_RETRY_MAX_ATTEMPTS";
    pub const RETRY_INTERVAL_MS: &str = "AGVLINK_RETRY_INTERVAL_MS";
    pub const RECONNECT_ENABLED: &str = "AGVLINK_RECONNECT_ENABLED";
    pub const RECONNECT_DELAY_MS: &str = "AGVLINK_RECONNECT_DELAY_MS";
    pub const MOVE_FLUSH_INTERVAL_MS: &str = "AGVLINK_MOVE_FLUSH_INTERVAL_MS";
    pub const LOG_JSON: &str = "AGVLINK_LOG_JSON";
}

/// Link type used to reach vehicles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    Tcp,
    Udp,
}

impl ChannelType {
    /// Network channels need a host and port per vehicle.
    pub fn requires_address(&self) -> bool {
        matches!(self, ChannelType::Tcp | ChannelType::Udp)
    }
}

/// Retransmission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    /// Attempts before an undelivered response is reported and dropped.
    pub max_attempts: u32,
    /// Fixed interval between attempts.
    pub interval_ms: u64,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            interval_ms: defaults::RETRY_INTERVAL_MS,
        }
    }
}

impl RetransmitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Reconnect-with-backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after a lost or failed connection.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub delay_ms: u64,
    /// Multiplier applied per consecutive failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the delay.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: defaults::RECONNECT_DELAY_MS,
            backoff_multiplier: defaults::RECONNECT_BACKOFF_MULTIPLIER,
            max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Wire format selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum MatcherConfig {
    Delimited {
        #[serde(default = "default_separator")]
        separator: char,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
    Json,
}

fn default_separator() -> char {
    ','
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig::Delimited {
            separator: default_separator(),
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

impl MatcherConfig {
    /// Build the configured matcher.
    pub fn build(&self) -> Arc<dyn ProtocolMatcher> {
        match self {
            MatcherConfig::Delimited {
                separator,
                prefix,
                suffix,
            } => Arc::new(DelimitedMatcher::new(*separator).with_frame(prefix, suffix)),
            MatcherConfig::Json => Arc::new(JsonMatcher),
        }
    }
}

/// Per-vehicle link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleConfig {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u32,
    /// JSON list of additional device addresses served by this vehicle.
    #[serde(default)]
    pub device_address: Option<String>,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for a single dispatch.
    pub request_timeout_ms: u64,
    /// How often staged movement commands are flushed to the vehicle.
    pub move_flush_interval_ms: u64,
    /// Drop the link while the vehicle is idle.
    pub disconnect_on_idle: bool,
    /// Command key of position report telegrams.
    pub position_command: String,
    /// Command key of outbound move telegrams.
    pub move_command: String,
    pub channel: ChannelType,
    pub matcher: MatcherConfig,
    pub retransmit: RetransmitConfig,
    pub reconnect: ReconnectConfig,
    pub vehicles: Vec<VehicleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            move_flush_interval_ms: defaults::MOVE_FLUSH_INTERVAL_MS,
            disconnect_on_idle: false,
            position_command: defaults::POSITION_COMMAND.to_string(),
            move_command: defaults::MOVE_COMMAND.to_string(),
            channel: ChannelType::default(),
            matcher: MatcherConfig::default(),
            retransmit: RetransmitConfig::default(),
            reconnect: ReconnectConfig::default(),
            vehicles: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn move_flush_interval(&self) -> Duration {
        Duration::from_millis(self.move_flush_interval_ms)
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(category = "config", path = %path.display(), vehicles = config.vehicles.len(), "Configuration loaded");
        Ok(config)
    }

    /// Apply `AGVLINK_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(lookup(env_vars::REQUEST_TIMEOUT_MS)) {
            self.request_timeout_ms = v;
        }
        if let Some(v) = parsed(lookup(env_vars::RETRY_MAX_ATTEMPTS)) {
            self.retransmit.max_attempts = v;
        }
        if let Some(v) = parsed(lookup(env_vars::RETRY_INTERVAL_MS)) {
            self.retransmit.interval_ms = v;
        }
        if let Some(v) = parsed(lookup(env_vars::RECONNECT_ENABLED)) {
            self.reconnect.enabled = v;
        }
        if let Some(v) = parsed(lookup(env_vars::RECONNECT_DELAY_MS)) {
            self.reconnect.delay_ms = v;
        }
        if let Some(v) = parsed(lookup(env_vars::MOVE_FLUSH_INTERVAL_MS)) {
            self.move_flush_interval_ms = v;
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be positive".into()));
        }
        if self.retransmit.max_attempts == 0 {
            return Err(Error::Config("retransmit.max_attempts must be at least 1".into()));
        }
        if self.retransmit.interval_ms == 0 {
            return Err(Error::Config("retransmit.interval_ms must be positive".into()));
        }
        if self.move_flush_interval_ms == 0 {
            return Err(Error::Config("move_flush_interval_ms must be positive".into()));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(Error::Config("reconnect.backoff_multiplier must be >= 1.0".into()));
        }

        let mut names = HashSet::new();
        for vehicle in &self.vehicles {
            if vehicle.name.trim().is_empty() {
                return Err(Error::Config("vehicle name must not be empty".into()));
            }
            if !names.insert(vehicle.name.as_str()) {
                return Err(Error::Config(format!("duplicate vehicle {}", vehicle.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_millis(3000));
        assert_eq!(config.retransmit.max_attempts, 3);
        assert_eq!(config.position_command, "rptpos");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r###"
            request_timeout_ms = 1500
            channel = "udp"

            [matcher]
            format = "delimited"
            separator = "|"
            prefix = "##"
            suffix = "##"

            [retransmit]
            max_attempts = 5

            [[vehicles]]
            name = "agv-1"
            host = "10.0.0.5"
            port = 6000
            "###,
        )
        .unwrap();

        assert_eq!(config.request_timeout_ms, 1500);
        assert_eq!(config.channel, ChannelType::Udp);
        assert_eq!(config.retransmit.max_attempts, 5);
        assert_eq!(config.retransmit.interval_ms, defaults::RETRY_INTERVAL_MS);
        assert_eq!(config.vehicles.len(), 1);
        assert_eq!(config.vehicles[0].port, 6000);

        let matcher = config.matcher.build();
        let protocol = matcher.decode("##agv-1|rptpos|1|0|A##").unwrap();
        assert_eq!(protocol.payload, "A");
    }

    #[test]
    fn test_validation_errors() {
        let result = EngineConfig::from_toml_str("request_timeout_ms = 0");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = EngineConfig::from_toml_str(
            r#"
            [[vehicles]]
            name = "agv-1"
            [[vehicles]]
            name = "agv-1"
            "#,
        );
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (env_vars::REQUEST_TIMEOUT_MS, "250"),
            (env_vars::RETRY_MAX_ATTEMPTS, "7"),
            (env_vars::RECONNECT_ENABLED, "false"),
            (env_vars::RETRY_INTERVAL_MS, "not-a-number"),
        ]);
        let mut config = EngineConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.retransmit.max_attempts, 7);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.retransmit.interval_ms, defaults::RETRY_INTERVAL_MS);
    }

    #[test]
    fn test_reconnect_backoff() {
        let reconnect = ReconnectConfig {
            enabled: true,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5000,
        };
        assert_eq!(reconnect.delay_for_attempt(1).as_millis(), 1000);
        assert_eq!(reconnect.delay_for_attempt(2).as_millis(), 2000);
        assert_eq!(reconnect.delay_for_attempt(3).as_millis(), 4000);
        assert_eq!(reconnect.delay_for_attempt(4).as_millis(), 5000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agvlink.toml");
        std::fs::write(&path, "move_flush_interval_ms = 200\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.move_flush_interval_ms, 200);

        let missing = EngineConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
