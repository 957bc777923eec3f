//! Settings and readback trees
//!
//! The settings tree is what operators edit; the readback tree is what the
//! instrument last reported. Both share the keys `output`, `shape`,
//! `frequency`, `Vhigh`, `Vlow` and `pulse.width`, so they flatten onto the
//! same key set and can be diffed with [`changed_entries`].

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Separator used when joining nested keys
pub const KEY_SEPARATOR: char = '.';

/// Nested `pulse` subtree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseSchema {
    /// Pulse width in seconds
    pub width: f64,
}

/// Operator-editable settings tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSchema {
    /// Transport port identifier
    pub port: String,
    /// Manufacturer
    pub brand: String,
    /// Model identifier
    pub model: String,
    /// Output relay state
    pub output: bool,
    /// Waveform shape token
    pub shape: String,
    /// Frequency in Hz
    pub frequency: f64,
    /// High level in volts
    #[serde(rename = "Vhigh")]
    pub vhigh: f64,
    /// Low level in volts
    #[serde(rename = "Vlow")]
    pub vlow: f64,
    /// Pulse parameters
    pub pulse: PulseSchema,
}

impl SettingsSchema {
    /// Zeroed settings with identity fields filled
    pub fn new(brand: &str, model: &str) -> Self {
        Self {
            brand: brand.to_string(),
            model: model.to_string(),
            ..Default::default()
        }
    }

    /// Copy the instrument values in, leaving identity fields untouched
    pub fn apply(&mut self, snapshot: &InstrumentSnapshot) {
        self.output = snapshot.output;
        self.shape = snapshot.shape.clone();
        self.frequency = snapshot.frequency;
        self.vhigh = snapshot.vhigh;
        self.vlow = snapshot.vlow;
        self.pulse.width = snapshot.pulse_width;
    }

    /// Serialize to a JSON tree
    pub fn to_value(&self) -> AppResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Last-observed instrument state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadbackSchema {
    /// Output relay state
    pub output: bool,
    /// Waveform shape token
    pub shape: String,
    /// Frequency in Hz
    pub frequency: f64,
    /// High level in volts
    #[serde(rename = "Vhigh")]
    pub vhigh: f64,
    /// Low level in volts
    #[serde(rename = "Vlow")]
    pub vlow: f64,
    /// Pulse parameters
    pub pulse: PulseSchema,
}

impl ReadbackSchema {
    /// Serialize to a JSON tree
    pub fn to_value(&self) -> AppResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// One consistent set of values read from the instrument in a cycle
///
/// Both trees are filled from the same snapshot, never from separate reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentSnapshot {
    /// Raw shape token
    pub shape: String,
    /// Output relay state
    pub output: bool,
    /// Frequency in Hz
    pub frequency: f64,
    /// High level in volts
    pub vhigh: f64,
    /// Low level in volts
    pub vlow: f64,
    /// Pulse width in seconds
    pub pulse_width: f64,
}

impl From<&InstrumentSnapshot> for ReadbackSchema {
    fn from(snapshot: &InstrumentSnapshot) -> Self {
        Self {
            output: snapshot.output,
            shape: snapshot.shape.clone(),
            frequency: snapshot.frequency,
            vhigh: snapshot.vhigh,
            vlow: snapshot.vlow,
            pulse: PulseSchema {
                width: snapshot.pulse_width,
            },
        }
    }
}

impl From<&ReadbackSchema> for InstrumentSnapshot {
    fn from(readback: &ReadbackSchema) -> Self {
        Self {
            shape: readback.shape.clone(),
            output: readback.output,
            frequency: readback.frequency,
            vhigh: readback.vhigh,
            vlow: readback.vlow,
            pulse_width: readback.pulse.width,
        }
    }
}

/// Flatten a JSON tree into `a.b.c -> leaf` pairs
///
/// Non-object roots flatten to a single entry under the empty key. Empty
/// objects produce no entries.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => flatten_into(&mut out, "", map),
        leaf => {
            out.insert(String::new(), leaf.clone());
        }
    }
    out
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, map: &Map<String, Value>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}{}{}", prefix, KEY_SEPARATOR, key)
        };
        match value {
            Value::Object(child) => flatten_into(out, &path, child),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// Leaves of `local` whose value differs from (or is missing in) `remote`
///
/// Numbers compare by value, so `1000` and `1000.0` are equal. Keys only
/// present in `remote` are ignored.
pub fn changed_entries(local: &Value, remote: &Value) -> Vec<(String, Value)> {
    let remote = flatten(remote);
    flatten(local)
        .into_iter()
        .filter(|(key, value)| match remote.get(key) {
            Some(current) => !values_equal(value, current),
            None => true,
        })
        .collect()
}

/// Equality that treats JSON numbers by numeric value
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}
