//! Text-line transport abstraction
//!
//! A transport carries newline-terminated ASCII commands to the instrument
//! and returns single-line replies. It knows nothing about SCPI semantics;
//! the driver layer builds commands and parses replies.
//!
//! Implementations:
//! - [`SerialTransport`]: RS-232 link via tokio-serial (feature `instrument_serial`)
//! - [`MockTransport`]: in-process instrument emulator for tests and `--simulate`

pub mod mock;
pub mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

use anyhow::Result;
use async_trait::async_trait;

/// Request/response text link to one instrument
///
/// Failures are reported as `anyhow` errors; the driver session decides
/// whether they propagate.
#[async_trait]
pub trait Transport: Send {
    /// Resource identifier (port path, or a label for emulated links)
    fn resource(&self) -> &str;

    /// Send a command without reading a reply
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one reply line (terminator stripped)
    async fn query(&mut self, command: &str) -> Result<String>;
}
