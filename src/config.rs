//! Figment-based configuration for the signal generator frontend.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/sgen.toml`, missing file is fine)
//! 2. environment variables prefixed with `SGEN_`
//!
//! Nested keys use a double underscore in environment variables:
//!
//! ```text
//! SGEN_APPLICATION__LOG_LEVEL=debug
//! SGEN_FRONTEND__PERIOD_MS=1000
//! SGEN_SERIAL__PORT=/dev/ttyUSB0
//! SGEN_TRANSPORT__FAULT_POLICY=propagate
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "sgen"
//! log_level = "info"
//!
//! [frontend]
//! model = "33250A"
//! index = 0
//! period_ms = 5000
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! ```

use crate::driver::FaultPolicy;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sgen.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Frontend identity and polling cadence
    pub frontend: FrontendConfig,
    /// Serial line parameters for the instrument link
    pub serial: SerialConfig,
    /// Transport fault handling
    pub transport: TransportConfig,
    /// Parameter store persistence
    pub store: StoreConfig,
    /// Periodic data record output
    pub data: DataConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sgen".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Frontend identity and timer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Instrument model identifier (e.g. "33250A")
    pub model: Option<String>,
    /// Frontend instance index used to build the equipment name
    pub index: Option<u32>,
    /// Polling period in milliseconds
    pub period_ms: u64,
    /// Equipment name prefix
    pub equipment_prefix: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            model: None,
            index: None,
            period_ms: default_period_ms(),
            equipment_prefix: "SGEN".to_string(),
        }
    }
}

impl FrontendConfig {
    /// Polling period as a `Duration`
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Serial line configuration (defaults match the 33250A RS-232 interface)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port (e.g. "/dev/ttyUSB0")
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Parity (none, odd, even)
    pub parity: String,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
    /// Command/response line terminator
    pub terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            data_bits: 7,
            parity: "even".to_string(),
            stop_bits: 2,
            timeout_ms: 2000,
            terminator: "\n".to_string(),
        }
    }
}

impl SerialConfig {
    /// Read timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Transport fault handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// What the driver does with a failed query or write
    pub fault_policy: FaultPolicy,
}

/// Parameter store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file the key/value tree is loaded from and saved to
    pub snapshot_path: Option<PathBuf>,
    /// Directory holding instance lock files (system temp dir if unset)
    pub runtime_dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Directory used for instance lock files
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sgen_daq"))
    }
}

/// Data record output configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// JSON-lines file receiving every periodic data record
    pub log_path: Option<PathBuf>,
}

fn default_period_ms() -> u64 {
    5000
}

impl Settings {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `SGEN_` environment variables, the TOML
    /// file, built-in defaults. The result is validated before returning.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SGEN_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and log format are known
    /// - Polling period is nonzero
    /// - Serial framing values are in range
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.frontend.period_ms == 0 {
            return Err(DaqError::Configuration(
                "frontend.period_ms must be > 0".to_string(),
            ));
        }

        if self.frontend.equipment_prefix.is_empty() {
            return Err(DaqError::Configuration(
                "frontend.equipment_prefix cannot be empty".to_string(),
            ));
        }

        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(DaqError::Configuration(format!(
                "Invalid serial.data_bits {}. Must be 5-8",
                self.serial.data_bits
            )));
        }

        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(DaqError::Configuration(format!(
                "Invalid serial.stop_bits {}. Must be 1 or 2",
                self.serial.stop_bits
            )));
        }

        let valid_parity = ["none", "odd", "even"];
        if !valid_parity.contains(&self.serial.parity.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid serial.parity '{}'. Must be one of: {}",
                self.serial.parity,
                valid_parity.join(", ")
            )));
        }

        if self.serial.terminator.is_empty() {
            return Err(DaqError::Configuration(
                "serial.terminator cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
