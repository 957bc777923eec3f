//! Signal generator drivers
//!
//! A driver maps named instrument parameters onto the instrument's SCPI
//! command set. It keeps no application state of its own: readings always
//! come from the instrument, and the only things it owns are the
//! [`ScpiSession`] and its static schema defaults.
//!
//! New models are added by implementing [`SignalGenerator`] and adding a
//! variant to [`SgenModel`]; [`create_driver`] picks the implementation.
//!
//! ```no_run
//! use sgen_daq::driver::{create_driver, FaultPolicy, ScpiSession, Shape};
//! use sgen_daq::transport::MockTransport;
//!
//! # async fn example() -> sgen_daq::error::AppResult<()> {
//! let session = ScpiSession::new(Box::new(MockTransport::new()), FaultPolicy::Log);
//! let sgen = create_driver("33250A", session)?;
//! sgen.set_shape(Shape::Pulse).await?;
//! sgen.set_pulse_width(0.002).await?;
//! println!("shape index {}", sgen.shape_index().await?);
//! # Ok(())
//! # }
//! ```

pub mod agilent_33250a;
pub mod session;

pub use agilent_33250a::Agilent33250A;
pub use session::{FaultPolicy, ScpiSession};

use crate::error::{AppResult, DaqError};
use crate::schema::{ReadbackSchema, SettingsSchema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Waveform shapes, in the instrument's fixed order
///
/// The ordinal of each variant is the shape index published in the data
/// record, so the order here must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// `SIN`
    Sine,
    /// `SQU`
    Square,
    /// `RAMP`
    Ramp,
    /// `PULS`
    Pulse,
    /// `NOIS`
    Noise,
    /// `DC`
    Dc,
    /// `USER` (arbitrary waveform)
    User,
}

impl Shape {
    /// All shapes in ordinal order
    pub const ALL: [Shape; 7] = [
        Shape::Sine,
        Shape::Square,
        Shape::Ramp,
        Shape::Pulse,
        Shape::Noise,
        Shape::Dc,
        Shape::User,
    ];

    /// SCPI token for `FUNC`
    pub fn token(self) -> &'static str {
        match self {
            Shape::Sine => "SIN",
            Shape::Square => "SQU",
            Shape::Ramp => "RAMP",
            Shape::Pulse => "PULS",
            Shape::Noise => "NOIS",
            Shape::Dc => "DC",
            Shape::User => "USER",
        }
    }

    /// Position in [`Shape::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Shape {
    type Err = DaqError;

    /// Exact token match; anything else is rejected
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Shape::ALL
            .iter()
            .copied()
            .find(|shape| shape.token() == s)
            .ok_or_else(|| DaqError::UnknownShape(s.to_string()))
    }
}

/// Output relay state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Output enabled
    On,
    /// Output disabled
    Off,
}

impl OutputState {
    /// SCPI token for `:OUTP`
    pub fn token(self) -> &'static str {
        match self {
            OutputState::On => "ON",
            OutputState::Off => "OFF",
        }
    }

    /// Parse a settings value
    ///
    /// Accepts the tokens `ON`, `OFF`, `0`, `1` (as strings), the numbers
    /// `0` and `1` (integer or float), and booleans.
    pub fn from_value(value: &Value) -> AppResult<Self> {
        let parsed = match value {
            Value::Bool(true) => Some(OutputState::On),
            Value::Bool(false) => Some(OutputState::Off),
            Value::Number(n) => match n.as_f64() {
                Some(v) if v == 1.0 => Some(OutputState::On),
                Some(v) if v == 0.0 => Some(OutputState::Off),
                _ => None,
            },
            Value::String(s) => match s.as_str() {
                "ON" | "1" => Some(OutputState::On),
                "OFF" | "0" => Some(OutputState::Off),
                _ => None,
            },
            _ => None,
        };
        parsed.ok_or_else(|| DaqError::InvalidValue {
            parameter: "output".to_string(),
            value: value.to_string(),
        })
    }
}

impl From<bool> for OutputState {
    fn from(on: bool) -> Self {
        if on {
            OutputState::On
        } else {
            OutputState::Off
        }
    }
}

/// Parsed `*IDN?` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer field
    pub manufacturer: String,
    /// Model field, compared against the requested model
    pub model: String,
    /// Serial number field (may be empty)
    pub serial: String,
    /// Firmware revision field (may be empty)
    pub firmware: String,
}

impl Identity {
    /// Parse a comma-separated identification line
    pub fn parse(line: &str) -> AppResult<Self> {
        let mut fields = line.split(',').map(str::trim);
        let manufacturer = fields.next().unwrap_or_default().to_string();
        let model = fields
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| DaqError::Parse {
                command: "*IDN?".to_string(),
                response: line.to_string(),
            })?
            .to_string();
        Ok(Self {
            manufacturer,
            model,
            serial: fields.next().unwrap_or_default().to_string(),
            firmware: fields.next().unwrap_or_default().to_string(),
        })
    }
}

/// Entry read from the instrument's error register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Numeric code, 0 means no error
    pub code: i32,
    /// Full diagnostic line as returned
    pub line: String,
}

impl ErrorRecord {
    /// Parse `<code>,"<message>"`
    pub fn parse(line: &str) -> AppResult<Self> {
        let code = line
            .split(',')
            .next()
            .map(str::trim)
            .and_then(|c| c.parse::<i32>().ok())
            .ok_or_else(|| DaqError::Parse {
                command: ":SYST:ERR?".to_string(),
                response: line.to_string(),
            })?;
        Ok(Self {
            code,
            line: line.to_string(),
        })
    }

    /// True when the code is nonzero
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

/// Supported instrument models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgenModel {
    /// Agilent 33250A 80 MHz function/arbitrary waveform generator
    A33250A,
}

impl SgenModel {
    /// Every supported model
    pub const ALL: [SgenModel; 1] = [SgenModel::A33250A];

    /// Model identifier as reported in `*IDN?`
    pub fn id(self) -> &'static str {
        match self {
            SgenModel::A33250A => "33250A",
        }
    }
}

impl fmt::Display for SgenModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SgenModel {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SgenModel::ALL
            .iter()
            .copied()
            .find(|m| m.id() == s)
            .ok_or_else(|| DaqError::UnsupportedModel(s.to_string()))
    }
}

/// Capability interface shared by all signal generator models
///
/// Getters return what the instrument reports. Under the `Log` fault policy
/// a failed query comes back as an empty reply, which numeric getters
/// report as [`DaqError::Parse`]; callers decide what to substitute.
#[async_trait]
pub trait SignalGenerator: Send + Sync {
    /// Model implemented by this driver
    fn model(&self) -> SgenModel;

    /// Manufacturer name used in the settings schema
    fn brand(&self) -> &'static str;

    /// Settings tree defaults (identity fields filled, values zeroed)
    fn settings_schema(&self) -> SettingsSchema {
        SettingsSchema::new(self.brand(), self.model().id())
    }

    /// Readback tree defaults
    fn readback_schema(&self) -> ReadbackSchema {
        ReadbackSchema::default()
    }

    /// Query `*IDN?`; transport faults always propagate
    async fn identify(&self) -> AppResult<Identity>;

    /// Reset to power-on state and clear status
    async fn reset(&self) -> AppResult<()>;

    /// Select the waveform shape
    async fn set_shape(&self, shape: Shape) -> AppResult<()>;

    /// Raw shape token as reported
    async fn shape(&self) -> AppResult<String>;

    /// Ordinal of the current shape; fails if the token is not a known shape
    async fn shape_index(&self) -> AppResult<usize> {
        let token = self.shape().await?;
        Ok(token.parse::<Shape>()?.index())
    }

    /// Set frequency in Hz
    async fn set_frequency(&self, hz: f64) -> AppResult<()>;

    /// Frequency in Hz
    async fn frequency(&self) -> AppResult<f64>;

    /// Set high level in volts
    async fn set_voltage_high(&self, volts: f64) -> AppResult<()>;

    /// High level in volts
    async fn voltage_high(&self) -> AppResult<f64>;

    /// Set low level in volts
    async fn set_voltage_low(&self, volts: f64) -> AppResult<()>;

    /// Low level in volts
    async fn voltage_low(&self) -> AppResult<f64>;

    /// Set pulse width in seconds
    async fn set_pulse_width(&self, seconds: f64) -> AppResult<()>;

    /// Pulse width in seconds
    async fn pulse_width(&self) -> AppResult<f64>;

    /// Switch the output relay
    async fn set_output(&self, state: OutputState) -> AppResult<()>;

    /// Output relay state (instrument reports 0 or 1)
    async fn output(&self) -> AppResult<bool>;

    /// Pop the oldest entry from the error register
    async fn last_error(&self) -> AppResult<ErrorRecord>;
}

/// Build the driver for a model identifier
///
/// # Errors
/// `UnsupportedModel` if no driver exists for `model`.
pub fn create_driver(model: &str, session: ScpiSession) -> AppResult<Box<dyn SignalGenerator>> {
    match model.parse::<SgenModel>()? {
        SgenModel::A33250A => Ok(Box::new(Agilent33250A::new(session))),
    }
}
