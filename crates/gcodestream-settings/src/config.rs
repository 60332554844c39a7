//! Configuration file handling
//!
//! Configuration is organized into logical sections:
//! - Connection settings (transport, port, baud rate, timeouts)
//! - Streaming settings (firmware, flow control and polling)
//! - Machine preferences (jog defaults, units)
//!
//! Files are `.toml` or `.json`, chosen by extension. Missing sections and
//! fields take their defaults.

use crate::error::{Result, SettingsError};
use gcodestream_communication::{
    ConnectionDriver, ConnectionParams, ControllerConfig, ControllerType, ErrorPolicy,
};
use gcodestream_core::Units;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the platform config dir holding our files
const APP_DIR: &str = "gcodestream";

/// File name of the default configuration
const CONFIG_FILE: &str = "config.toml";

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Transport to open
    pub connection_type: ConnectionDriver,
    /// Serial port, host name or WebSocket URL
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// TCP port for network connections
    pub tcp_port: u16,
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_type: ConnectionDriver::Serial,
            port: String::new(),
            baud_rate: 115200,
            tcp_port: 23,
            timeout_ms: 5000,
        }
    }
}

impl ConnectionSettings {
    /// Transport parameters for these settings
    pub fn to_params(&self) -> ConnectionParams {
        let params = match self.connection_type {
            ConnectionDriver::Serial => ConnectionParams::serial(&self.port, self.baud_rate),
            ConnectionDriver::Tcp => ConnectionParams::tcp(&self.port, self.tcp_port),
            ConnectionDriver::WebSocket => ConnectionParams::websocket(&self.port),
        };
        params.with_timeout_ms(self.timeout_ms)
    }
}

/// Streaming and session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Firmware on the other end
    pub firmware: ControllerType,
    /// Receive buffer override; the firmware's own size when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    /// Status poll interval in milliseconds
    pub status_poll_rate_ms: u64,
    /// Poll for status reports at all
    pub status_polling_enabled: bool,
    /// Send one command at a time
    pub single_step_mode: bool,
    /// Reaction to a failed command while streaming
    pub error_policy: ErrorPolicy,
    /// How long commands still active after a cancel may take, in milliseconds
    pub drain_timeout_ms: u64,
    /// Unanswered polls tolerated before polling again regardless
    pub max_outstanding_polls: u32,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        let runtime = ControllerConfig::default();
        Self {
            firmware: ControllerType::Grbl,
            buffer_size: runtime.buffer_size,
            status_poll_rate_ms: runtime.status_poll_rate_ms,
            status_polling_enabled: runtime.status_polling_enabled,
            single_step_mode: runtime.single_step_mode,
            error_policy: runtime.error_policy,
            drain_timeout_ms: runtime.drain_timeout_ms,
            max_outstanding_polls: runtime.max_outstanding_polls,
        }
    }
}

impl From<StreamingSettings> for ControllerConfig {
    fn from(settings: StreamingSettings) -> Self {
        let mut config = ControllerConfig::new()
            .with_status_poll_rate_ms(settings.status_poll_rate_ms)
            .with_status_polling(settings.status_polling_enabled)
            .with_single_step_mode(settings.single_step_mode)
            .with_error_policy(settings.error_policy)
            .with_drain_timeout_ms(settings.drain_timeout_ms);
        config.buffer_size = settings.buffer_size;
        config.max_outstanding_polls = settings.max_outstanding_polls;
        config
    }
}

/// Machine preference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// Jog feed rate in units/min
    pub jog_feed_rate: f64,
    /// Default jog increment
    pub jog_step: f64,
    /// Display units, `mm` or `in`
    pub units: String,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            jog_feed_rate: 1000.0,
            jog_step: 1.0,
            units: "mm".to_string(),
        }
    }
}

impl MachineSettings {
    /// Units as the core type; anything unrecognised is `Unknown`
    pub fn units(&self) -> Units {
        match self.units.to_ascii_lowercase().as_str() {
            "mm" => Units::MM,
            "in" | "inch" => Units::INCH,
            _ => Units::Unknown,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Streaming settings
    pub streaming: StreamingSettings,
    /// Machine preferences
    pub machine: MachineSettings,
}

enum Format {
    Toml,
    Json,
}

fn format_of(path: &Path) -> Result<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Format::Toml),
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Format::Json),
        _ => Err(SettingsError::UnsupportedFormat(path.display().to_string())),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config dir>/gcodestream/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory(
                    "no configuration directory on this platform".to_string(),
                )
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)?;
        let config: Self = match format {
            Format::Toml => toml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = match format_of(path)? {
            Format::Toml => toml::to_string_pretty(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if self.connection.timeout_ms == 0 {
            return Err(SettingsError::invalid("connection.timeout_ms", "must be > 0"));
        }

        let streaming = &self.streaming;
        if streaming.status_poll_rate_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.status_poll_rate_ms",
                "must be > 0",
            ));
        }
        if let Some(size) = streaming.buffer_size {
            if size < 2 {
                return Err(SettingsError::invalid(
                    "streaming.buffer_size",
                    format!("{} bytes cannot hold a command and its terminator", size),
                ));
            }
        }
        if streaming.drain_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.drain_timeout_ms",
                "must be > 0",
            ));
        }
        if streaming.max_outstanding_polls == 0 {
            return Err(SettingsError::invalid(
                "streaming.max_outstanding_polls",
                "must be > 0",
            ));
        }

        if self.machine.jog_feed_rate <= 0.0 {
            return Err(SettingsError::invalid("machine.jog_feed_rate", "must be > 0"));
        }
        if self.machine.jog_step <= 0.0 {
            return Err(SettingsError::invalid("machine.jog_step", "must be > 0"));
        }
        if self.machine.units() == Units::Unknown {
            return Err(SettingsError::invalid(
                "machine.units",
                format!("'{}' is neither mm nor in", self.machine.units),
            ));
        }
        Ok(())
    }

    /// Runtime controller configuration, jog feed rate included
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::from(self.streaming.clone())
            .with_jog_feed_rate(self.machine.jog_feed_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.connection.tcp_port, 23);
        assert_eq!(config.streaming.status_poll_rate_ms, 200);
        assert_eq!(config.streaming.error_policy, ErrorPolicy::Continue);
        assert_eq!(config.machine.units(), Units::MM);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.connection.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.streaming.buffer_size = Some(1);
        assert!(config.validate().is_err());
        config.streaming.buffer_size = Some(2);
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.streaming.status_poll_rate_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.machine.units = "furlongs".to_string();
        assert!(matches!(
            config.validate(),
            Err(SettingsError::InvalidSetting { key, .. }) if key == "machine.units"
        ));
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config: Config = toml::from_str(
            r#"
            [streaming]
            firmware = "smoothie"
            error_policy = "halt"
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.firmware, ControllerType::Smoothieware);
        assert_eq!(config.streaming.error_policy, ErrorPolicy::Halt);
        assert_eq!(config.streaming.drain_timeout_ms, 5000);
        assert_eq!(config.connection, ConnectionSettings::default());
    }

    #[test]
    fn test_controller_config_conversion() {
        let mut config = Config::default();
        config.streaming.buffer_size = Some(64);
        config.streaming.single_step_mode = true;
        config.streaming.max_outstanding_polls = 5;
        config.machine.jog_feed_rate = 250.0;

        let runtime = config.controller_config();
        assert_eq!(runtime.buffer_size, Some(64));
        assert!(runtime.single_step_mode);
        assert_eq!(runtime.max_outstanding_polls, 5);
        assert_eq!(runtime.jog_feed_rate, 250.0);
    }

    #[test]
    fn test_connection_params() {
        let settings = ConnectionSettings {
            connection_type: ConnectionDriver::Tcp,
            port: "cnc.local".to_string(),
            tcp_port: 8080,
            timeout_ms: 1500,
            ..Default::default()
        };
        let params = settings.to_params();
        assert_eq!(params.driver, ConnectionDriver::Tcp);
        assert_eq!(params.port, "cnc.local");
        assert_eq!(params.network_port, 8080);
        assert_eq!(params.timeout_ms, 1500);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Config::default()
            .save_to_file(Path::new("settings.yaml"))
            .unwrap_err();
        assert!(matches!(err, SettingsError::UnsupportedFormat(_)));
    }
}
