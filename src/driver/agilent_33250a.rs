//! Agilent 33250A 80 MHz Function / Arbitrary Waveform Generator
//!
//! Reference: Agilent 33250A User's Guide, chapter 4 (Remote Interface)
//!
//! Protocol Overview:
//! - RS-232: 9600 baud, 7 data bits, even parity, 2 stop bits
//! - ASCII SCPI commands terminated by `\n`
//! - Numeric replies in `+1.000000000000000E+03` form
//! - Error register read with `:SYST:ERR?` as `<code>,"<message>"`
//!
//! Commands used:
//!
//! | Parameter   | Write             | Query          |
//! |-------------|-------------------|----------------|
//! | shape       | `FUNC <shape>`    | `FUNC?`        |
//! | frequency   | `FREQ <hz>`       | `FREQ?`        |
//! | Vhigh       | `VOLT:HIGH <v>`   | `VOLT:HIGH?`   |
//! | Vlow        | `VOLT:LOW <v>`    | `VOLT:LOW?`    |
//! | pulse.width | `PULSE:WIDTH <s>` | `PULSE:WIDTH?` |
//! | output      | `:OUTP <ON/OFF>`  | `:OUTP?`       |

use super::{ErrorRecord, Identity, OutputState, ScpiSession, SgenModel, Shape, SignalGenerator};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use tracing::debug;

/// Driver for the Agilent 33250A
pub struct Agilent33250A {
    session: ScpiSession,
}

impl Agilent33250A {
    /// Create a driver over an open session
    pub fn new(session: ScpiSession) -> Self {
        Self { session }
    }

    /// Query a numeric value
    async fn query_number(&self, command: &str) -> AppResult<f64> {
        let response = self.session.query(command).await?;
        parse_number(command, &response)
    }

    async fn write_number(&self, header: &str, value: f64) -> AppResult<()> {
        if !value.is_finite() {
            return Err(DaqError::InvalidValue {
                parameter: header.to_string(),
                value: value.to_string(),
            });
        }
        self.session.write(&format!("{} {}", header, value)).await
    }
}

/// Parse a numeric reply (handles scientific notation and a leading `+`)
fn parse_number(command: &str, response: &str) -> AppResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| DaqError::Parse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

#[async_trait]
impl SignalGenerator for Agilent33250A {
    fn model(&self) -> SgenModel {
        SgenModel::A33250A
    }

    fn brand(&self) -> &'static str {
        "Agilent"
    }

    async fn identify(&self) -> AppResult<Identity> {
        let line = self.session.query_checked("*CLS; *IDN?").await?;
        Identity::parse(&line)
    }

    async fn reset(&self) -> AppResult<()> {
        debug!("resetting 33250A");
        self.session.write("*RST").await?;
        self.session.write("*CLS").await
    }

    async fn set_shape(&self, shape: Shape) -> AppResult<()> {
        self.session.write(&format!("FUNC {}", shape.token())).await
    }

    async fn shape(&self) -> AppResult<String> {
        self.session.query("FUNC?").await
    }

    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        self.write_number("FREQ", hz).await
    }

    async fn frequency(&self) -> AppResult<f64> {
        self.query_number("FREQ?").await
    }

    async fn set_voltage_high(&self, volts: f64) -> AppResult<()> {
        self.write_number("VOLT:HIGH", volts).await
    }

    async fn voltage_high(&self) -> AppResult<f64> {
        self.query_number("VOLT:HIGH?").await
    }

    async fn set_voltage_low(&self, volts: f64) -> AppResult<()> {
        self.write_number("VOLT:LOW", volts).await
    }

    async fn voltage_low(&self) -> AppResult<f64> {
        self.query_number("VOLT:LOW?").await
    }

    async fn set_pulse_width(&self, seconds: f64) -> AppResult<()> {
        self.write_number("PULSE:WIDTH", seconds).await
    }

    async fn pulse_width(&self) -> AppResult<f64> {
        self.query_number("PULSE:WIDTH?").await
    }

    async fn set_output(&self, state: OutputState) -> AppResult<()> {
        self.session.write(&format!(":OUTP {}", state.token())).await
    }

    async fn output(&self) -> AppResult<bool> {
        let response = self.session.query(":OUTP?").await?;
        let value = response
            .trim()
            .parse::<i32>()
            .map_err(|_| DaqError::Parse {
                command: ":OUTP?".to_string(),
                response: response.clone(),
            })?;
        Ok(value != 0)
    }

    async fn last_error(&self) -> AppResult<ErrorRecord> {
        let line = self.session.query(":SYST:ERR?").await?;
        ErrorRecord::parse(&line)
    }
}
