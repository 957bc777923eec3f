//! In-process instrument emulator
//!
//! `MockTransport` behaves like an Agilent 33250A on the other end of the
//! line: it keeps waveform state, answers the queries the driver uses, and
//! queues SCPI error entries for bad commands. It also provides:
//! - Call logging for test verification
//! - Scripted replies that override the emulated ones
//! - Controllable failure injection
//!
//! Clones share state, so a test can keep a handle after moving one clone
//! into a driver.

use super::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_IDENTITY: &str = "Agilent Technologies,33250A,0,1.0-1.5-1.0";
const SHAPES: [&str; 7] = ["SIN", "SQU", "RAMP", "PULS", "NOIS", "DC", "USER"];

/// One logged transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `write` was called with this command
    Write(String),
    /// `query` was called with this command
    Query(String),
}

#[derive(Debug)]
struct EmulatedState {
    shape: String,
    frequency: f64,
    vhigh: f64,
    vlow: f64,
    pulse_width: f64,
    output: bool,
    errors: VecDeque<(i32, String)>,
}

impl Default for EmulatedState {
    fn default() -> Self {
        // 33250A power-on state: 1 kHz sine, 100 mVpp, output off
        Self {
            shape: "SIN".to_string(),
            frequency: 1000.0,
            vhigh: 0.05,
            vlow: -0.05,
            pulse_width: 0.0001,
            output: false,
            errors: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: EmulatedState,
    identity: Option<String>,
    scripted: HashMap<String, String>,
    calls: Vec<Call>,
    fail_next: usize,
    offline: bool,
}

/// Emulated instrument link
#[derive(Clone)]
pub struct MockTransport {
    resource: String,
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create an emulator answering as a 33250A
    pub fn new() -> Self {
        Self {
            resource: "mock".to_string(),
            inner: Arc::default(),
        }
    }

    /// Use a different resource label
    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }

    /// Replace the `*IDN?` reply
    pub fn with_identity(self, identity: &str) -> Self {
        self.lock().identity = Some(identity.to_string());
        self
    }

    /// Always answer `command` with `response`, bypassing the emulation
    pub fn respond_to(&self, command: &str, response: &str) {
        self.lock()
            .scripted
            .insert(command.to_string(), response.to_string());
    }

    /// Make the next `count` calls fail
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Make every call fail until set back to `false`
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Queue an entry in the emulated error register
    pub fn push_error(&self, code: i32, message: &str) {
        self.lock()
            .state
            .errors
            .push_back((code, message.to_string()));
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Commands passed to `write`, in order
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(cmd) => Some(cmd.clone()),
                Call::Query(_) => None,
            })
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_failure(inner: &mut Inner, command: &str) -> Result<()> {
        if inner.offline {
            return Err(anyhow!("emulated link offline while sending '{}'", command));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(anyhow!("injected failure on '{}'", command));
        }
        Ok(())
    }
}

impl Inner {
    /// Execute one `;`-separated command list and return the last reply
    fn execute(&mut self, line: &str) -> Option<String> {
        let mut reply = None;
        for part in line.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(r) = self.execute_one(part) {
                reply = Some(r);
            }
        }
        reply
    }

    fn execute_one(&mut self, command: &str) -> Option<String> {
        let (header, argument) = match command.split_once(char::is_whitespace) {
            Some((h, a)) => (h, Some(a.trim())),
            None => (command, None),
        };
        let header = header.trim_start_matches(':').to_ascii_uppercase();

        match (header.as_str(), argument) {
            ("*RST", None) => {
                let errors = std::mem::take(&mut self.state.errors);
                self.state = EmulatedState {
                    errors,
                    ..EmulatedState::default()
                };
                None
            }
            ("*CLS", None) => {
                self.state.errors.clear();
                None
            }
            ("*IDN?", None) => Some(
                self.identity
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IDENTITY.to_string()),
            ),
            ("FUNC?", None) => Some(self.state.shape.clone()),
            ("FUNC", Some(arg)) => {
                let shape = arg.to_ascii_uppercase();
                if SHAPES.contains(&shape.as_str()) {
                    self.state.shape = shape;
                } else {
                    self.push(-224, "Illegal parameter value");
                }
                None
            }
            ("FREQ?", None) => Some(format_number(self.state.frequency)),
            ("FREQ", Some(arg)) => {
                if let Some(v) = self.number(arg) {
                    self.state.frequency = v;
                }
                None
            }
            ("VOLT:HIGH?", None) => Some(format_number(self.state.vhigh)),
            ("VOLT:HIGH", Some(arg)) => {
                if let Some(v) = self.number(arg) {
                    if v <= self.state.vlow {
                        self.push(-222, "Data out of range");
                    } else {
                        self.state.vhigh = v;
                    }
                }
                None
            }
            ("VOLT:LOW?", None) => Some(format_number(self.state.vlow)),
            ("VOLT:LOW", Some(arg)) => {
                if let Some(v) = self.number(arg) {
                    if v >= self.state.vhigh {
                        self.push(-222, "Data out of range");
                    } else {
                        self.state.vlow = v;
                    }
                }
                None
            }
            ("PULSE:WIDTH?", None) => Some(format_number(self.state.pulse_width)),
            ("PULSE:WIDTH", Some(arg)) => {
                if let Some(v) = self.number(arg) {
                    self.state.pulse_width = v;
                }
                None
            }
            ("OUTP?", None) => Some(if self.state.output { "1" } else { "0" }.to_string()),
            ("OUTP", Some(arg)) => {
                match arg.to_ascii_uppercase().as_str() {
                    "ON" | "1" => self.state.output = true,
                    "OFF" | "0" => self.state.output = false,
                    _ => self.push(-224, "Illegal parameter value"),
                }
                None
            }
            ("SYST:ERR?", None) => Some(match self.state.errors.pop_front() {
                Some((code, message)) => format!("{},\"{}\"", code, message),
                None => "0,\"No error\"".to_string(),
            }),
            _ => {
                self.push(-113, "Undefined header");
                None
            }
        }
    }

    fn number(&mut self, arg: &str) -> Option<f64> {
        match arg.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.push(-104, "Data type error");
                None
            }
        }
    }

    fn push(&mut self, code: i32, message: &str) {
        self.state.errors.push_back((code, message.to_string()));
    }
}

/// Format like the instrument does: `+1.000000000000000E+03`
fn format_number(value: f64) -> String {
    let formatted = format!("{:.15E}", value);
    let (mantissa, exponent) = formatted.split_once('E').unwrap_or((&formatted, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if value.is_sign_negative() { "" } else { "+" };
    format!("{}{}E{:+03}", sign, mantissa, exponent)
}

#[async_trait]
impl Transport for MockTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::Write(command.to_string()));
        Self::check_failure(&mut inner, command)?;
        inner.execute(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.calls.push(Call::Query(command.to_string()));
        Self::check_failure(&mut inner, command)?;
        if let Some(response) = inner.scripted.get(command) {
            return Ok(response.clone());
        }
        inner
            .execute(command)
            .ok_or_else(|| anyhow!("no reply to '{}' (read timeout)", command))
    }
}
