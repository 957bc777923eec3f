//! RS-232 transport for the instrument link
//!
//! Opens the port with the framing the 33250A expects (9600 baud, 7 data
//! bits, even parity, 2 stop bits, no flow control by default) and exchanges
//! newline-terminated ASCII lines. Serial support is behind the
//! `instrument_serial` feature; without it `open` fails with
//! [`DaqError::SerialFeatureDisabled`].

use super::Transport;
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_serial")]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial line to one instrument
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Reply timeout
    timeout: Duration,

    /// Line terminator appended to commands and stripped from replies
    terminator: String,

    #[cfg(feature = "instrument_serial")]
    port: BufReader<SerialStream>,
}

impl SerialTransport {
    /// Open the configured port
    ///
    /// # Errors
    /// Returns `Io` if the port cannot be opened, or `SerialFeatureDisabled`
    /// when built without serial support.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, config: &SerialConfig) -> AppResult<Self> {
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match config.parity.as_str() {
            "odd" => tokio_serial::Parity::Odd,
            "even" => tokio_serial::Parity::Even,
            _ => tokio_serial::Parity::None,
        };
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(port_name, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Failed to open serial port '{}': {}", port_name, e),
                ))
            })?;

        debug!(port = port_name, baud = config.baud_rate, "serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            timeout: config.timeout(),
            terminator: config.terminator.clone(),
            port: BufReader::new(stream),
        })
    }

    /// Open the configured port
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(port_name: &str, config: &SerialConfig) -> AppResult<Self> {
        let _ = (port_name, config);
        Err(DaqError::SerialFeatureDisabled)
    }

    #[cfg(feature = "instrument_serial")]
    async fn send_line(&mut self, command: &str) -> Result<()> {
        let payload = format!("{}{}", command, self.terminator);
        self.port
            .get_mut()
            .write_all(payload.as_bytes())
            .await
            .with_context(|| format!("Failed to write '{}' to {}", command, self.port_name))?;
        self.port
            .get_mut()
            .flush()
            .await
            .context("Failed to flush serial port")?;
        debug!(port = %self.port_name, command, "sent");
        Ok(())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn resource(&self) -> &str {
        &self.port_name
    }

    #[cfg(feature = "instrument_serial")]
    async fn write(&mut self, command: &str) -> Result<()> {
        self.send_line(command).await
    }

    #[cfg(feature = "instrument_serial")]
    async fn query(&mut self, command: &str) -> Result<String> {
        self.send_line(command).await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.port.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("Serial read timeout after {:?} on '{}'", self.timeout, command))?
            .with_context(|| format!("Failed to read reply to '{}'", command))?;

        if read == 0 {
            return Err(anyhow!("Unexpected EOF from {}", self.port_name));
        }

        let response = line.trim_end_matches(['\r', '\n']).trim().to_string();
        debug!(port = %self.port_name, command, response = %response, "received");
        Ok(response)
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write(&mut self, _command: &str) -> Result<()> {
        Err(DaqError::SerialFeatureDisabled.into())
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn query(&mut self, _command: &str) -> Result<String> {
        Err(DaqError::SerialFeatureDisabled.into())
    }
}
