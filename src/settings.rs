// src/settings.rs
//
// Ground station settings, stored as TOML in the user's config directory.
// Every field has a default so a partial (or missing) file is always usable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::{IoError, Parity, PortTarget};
use crate::link::SessionOptions;
use crate::telemetry::DEFAULT_MARKER;

/// Longest blocking read allowed; bounds how long a stop request can wait
pub const MAX_READ_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LinkSettings {
    /// Serial port of the LoRa modem. None = pick one at runtime.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Prefix the modem puts in front of every receive report
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Directory for flight CSV logs
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
    /// Directory for the session log file. None = console only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}
fn default_read_timeout_ms() -> u64 {
    250
}
fn default_silence_timeout_secs() -> u64 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_max_line_length() -> usize {
    crate::io::serial::DEFAULT_MAX_LINE_LENGTH
}
fn default_csv_dir() -> PathBuf {
    PathBuf::from("Flight_Logs")
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            marker: default_marker(),
            read_timeout_ms: default_read_timeout_ms(),
            silence_timeout_secs: default_silence_timeout_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_line_length: default_max_line_length(),
            csv_dir: default_csv_dir(),
            log_dir: None,
        }
    }
}

impl LinkSettings {
    /// `<config dir>/groundlink/settings.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("groundlink").join("settings.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, IoError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IoError::config(format!("failed to read {}: {}", path.display(), e)))?;

        let settings: LinkSettings = toml::from_str(&content)
            .map_err(|e| IoError::config(format!("failed to parse {}: {}", path.display(), e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load the file if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self, IoError> {
        if path.exists() {
            Self::load(path)
        } else {
            crate::tlog!(
                "[settings] {} not found, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| IoError::config(format!("failed to serialize settings: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), IoError> {
        if self.marker.is_empty() {
            return Err(IoError::config("marker must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(IoError::config("baud_rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(IoError::config(format!(
                "data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(IoError::config(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.max_line_length == 0 {
            return Err(IoError::config("max_line_length must be positive"));
        }
        if self.silence_timeout_secs == 0 {
            return Err(IoError::config("silence_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Read timeout, clamped to [`MAX_READ_TIMEOUT_MS`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.clamp(1, MAX_READ_TIMEOUT_MS))
    }

    /// Port target for the configured port, if one is set
    pub fn to_port_target(&self) -> Option<PortTarget> {
        let port = self.port.as_ref()?;
        Some(PortTarget {
            port: port.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            read_timeout: self.read_timeout(),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            target: self.to_port_target(),
            marker: self.marker.clone(),
            silence_timeout: Duration::from_secs(self.silence_timeout_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_line_length: self.max_line_length,
            ..SessionOptions::default()
        }
    }
}
