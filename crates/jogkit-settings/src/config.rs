//! Configuration for JogKit
//!
//! Provides configuration file handling and validation. Supports JSON and
//! TOML file formats stored in a platform-specific directory.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, timeouts, reconnect policy, status polling)
//! - Dispatcher settings (queue capacity, command timeout, line length)
//! - Machine settings (units, soft limits, homing, jog defaults)
//! - Event bus settings (history, channel capacity)

use jogkit_core::{Axis, EventBusConfig, Position, SoftLimits, Units};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, SettingsError, SettingsResult};

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Last used port; `mock` selects the simulated controller
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Transport open timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Retry failed connects and dropped links
    pub auto_reconnect: bool,
    /// Retries before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first retry
    pub reconnect_delay_ms: u64,
    /// Delay multiplier per attempt (1.0 = fixed delay)
    pub reconnect_backoff: f64,
    /// Status query interval, 0 disables polling
    pub status_poll_interval_ms: u64,
}

impl ConnectionSettings {
    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.reconnect_delay_ms as f64 * self.reconnect_backoff.powi(exponent);
        Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }

    /// Open timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Poll interval, `None` when disabled
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.status_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.status_poll_interval_ms))
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            reconnect_backoff: 1.0,
            status_poll_interval_ms: 200,
        }
    }
}

/// Command dispatcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Maximum queued non-emergency commands
    pub queue_capacity: usize,
    /// Acknowledgment timeout per command
    pub command_timeout_ms: u64,
    /// Longest accepted command line in bytes
    pub max_line_length: usize,
}

impl DispatcherSettings {
    /// Command timeout as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            command_timeout_ms: 10_000,
            max_line_length: 80,
        }
    }
}

/// Machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// Machine-wide unit flag
    pub units: Units,
    /// Travel limits in the machine frame
    pub soft_limits: SoftLimits,
    /// Default homing order
    pub homing_sequence: Vec<Axis>,
    /// Machine-frame move after homing; zero skips it
    pub homing_retract: Position,
    /// Default incremental jog distance
    pub jog_distance: f64,
    /// Default jog feed rate in units/min
    pub jog_feed_rate: f64,
    /// Step period of continuous jogs
    pub jog_step_interval_ms: u64,
    /// Smallest per-axis move that is recorded and broadcast
    pub position_change_threshold: f64,
    /// Position history entries kept
    pub position_history_size: usize,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            units: Units::Millimeters,
            soft_limits: SoftLimits::default(),
            homing_sequence: vec![Axis::Z, Axis::X, Axis::Y],
            homing_retract: Position::ORIGIN,
            jog_distance: 1.0,
            jog_feed_rate: 1000.0,
            jog_step_interval_ms: 100,
            position_change_threshold: 0.001,
            position_history_size: 1000,
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusSettings {
    /// Broadcast channel capacity
    pub channel_capacity: usize,
    /// Keep a history of published events
    pub enable_history: bool,
    /// History entries kept
    pub max_history_size: usize,
    /// History retention in seconds
    pub history_retention_secs: u64,
}

impl EventBusSettings {
    /// Convert to the bus configuration
    pub fn to_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            channel_capacity: self.channel_capacity,
            enable_history: self.enable_history,
            max_history_size: self.max_history_size,
            history_retention: Duration::from_secs(self.history_retention_secs),
        }
    }
}

impl Default for EventBusSettings {
    fn default() -> Self {
        let bus = EventBusConfig::default();
        Self {
            channel_capacity: bus.channel_capacity,
            enable_history: bus.enable_history,
            max_history_size: bus.max_history_size,
            history_retention_secs: bus.history_retention.as_secs(),
        }
    }
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Dispatcher settings
    pub dispatcher: DispatcherSettings,
    /// Machine settings
    pub machine: MachineSettings,
    /// Event bus settings
    pub event_bus: EventBusSettings,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("toml") => Ok(Format::Toml),
        other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("<none>").to_string()).into()),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform default location, `<config_dir>/jogkit/config.toml`
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("jogkit").join("config.toml"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no configuration directory on this platform".into())
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, or defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| SettingsError::SaveError(e.to_string()))?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        let c = &self.connection;
        if c.baud_rate == 0 {
            return Err(invalid("connection.baud_rate", "must be > 0"));
        }
        if c.connect_timeout_ms == 0 {
            return Err(invalid("connection.connect_timeout_ms", "must be > 0"));
        }
        if !(c.reconnect_backoff.is_finite() && c.reconnect_backoff >= 1.0) {
            return Err(invalid("connection.reconnect_backoff", "must be >= 1.0"));
        }

        let d = &self.dispatcher;
        if d.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity", "must be > 0"));
        }
        if d.command_timeout_ms == 0 {
            return Err(invalid("dispatcher.command_timeout_ms", "must be > 0"));
        }
        if d.max_line_length == 0 {
            return Err(invalid("dispatcher.max_line_length", "must be > 0"));
        }

        let m = &self.machine;
        if !m.soft_limits.is_consistent() {
            return Err(invalid("machine.soft_limits", "min must not exceed max"));
        }
        if m.homing_sequence.is_empty() {
            return Err(invalid("machine.homing_sequence", "must name at least one axis"));
        }
        let unique: HashSet<Axis> = m.homing_sequence.iter().copied().collect();
        if unique.len() != m.homing_sequence.len() {
            return Err(invalid("machine.homing_sequence", "axes must not repeat"));
        }
        if !m.homing_retract.is_finite() {
            return Err(invalid("machine.homing_retract", "must be finite"));
        }
        if !(m.jog_distance > 0.0) {
            return Err(invalid("machine.jog_distance", "must be > 0"));
        }
        if !(m.jog_feed_rate > 0.0) {
            return Err(invalid("machine.jog_feed_rate", "must be > 0"));
        }
        if m.jog_step_interval_ms == 0 {
            return Err(invalid("machine.jog_step_interval_ms", "must be > 0"));
        }
        if !(m.position_change_threshold >= 0.0) {
            return Err(invalid("machine.position_change_threshold", "must be >= 0"));
        }

        if self.event_bus.channel_capacity == 0 {
            return Err(invalid("event_bus.channel_capacity", "must be > 0"));
        }

        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidSetting {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.machine.homing_sequence,
            vec![Axis::Z, Axis::X, Axis::Y]
        );
    }

    #[test]
    fn test_retry_delay_backoff() {
        let mut c = ConnectionSettings {
            reconnect_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(c.retry_delay(1), Duration::from_millis(100));
        assert_eq!(c.retry_delay(3), Duration::from_millis(100));

        c.reconnect_backoff = 2.0;
        assert_eq!(c.retry_delay(1), Duration::from_millis(100));
        assert_eq!(c.retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_poll_interval_disabled_at_zero() {
        let c = ConnectionSettings {
            status_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(c.poll_interval().is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::new();
        config.machine.homing_sequence = vec![Axis::X, Axis::X];
        assert!(matches!(
            config.validate(),
            Err(SettingsError::InvalidSetting { key, .. }) if key == "machine.homing_sequence"
        ));

        let mut config = Config::new();
        config.machine.soft_limits.min.x = 500.0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.connection.reconnect_backoff = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Config::new()
            .save_to_file(Path::new("config.yaml"))
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Config(ConfigError::UnsupportedFormat(_))
        ));
    }
}
