//! Signal generator equipment
//!
//! [`SignalGeneratorEquipment`] owns one driver and keeps the store's
//! `Settings` and `Readback` trees in step with the instrument:
//!
//! ```text
//! tick ──> read snapshot ──> Readback (merge) ──> Settings (changed keys only)
//!                      └───> DataRecord ──> broadcast
//!
//! operator edit ──> SettingChange ──> driver setter ──> :SYST:ERR?
//! ```
//!
//! Everything runs on one task; the driver and both schemas are only touched
//! from [`SignalGeneratorEquipment::run`].

use crate::driver::{ErrorRecord, Identity, OutputState, Shape, SignalGenerator};
use crate::error::{AppResult, DaqError};
use crate::event::{DataRecord, EventPublisher};
use crate::schema::{changed_entries, flatten, InstrumentSnapshot, ReadbackSchema, SettingsSchema};
use crate::store::{join_path, OperatorMessage, ParameterStore, SettingChange};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest polling period accepted by [`SignalGeneratorEquipment::with_period`]
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// `{prefix}-{model}-{index:02}`, e.g. `SGEN-33250A-00`
pub fn equipment_name(prefix: &str, model: &str, index: u32) -> String {
    format!("{}-{}-{:02}", prefix, model, index)
}

/// Store path of the operator-editable settings tree
pub fn settings_path(equipment: &str) -> String {
    format!("/Equipment/{}/Settings", equipment)
}

/// Store path of the readback tree
pub fn readback_path(equipment: &str) -> String {
    format!("/Equipment/{}/Readback", equipment)
}

/// Pick the port: explicit argument, then configuration, then the store
pub fn resolve_port(
    explicit: Option<&str>,
    configured: Option<&str>,
    store: &dyn ParameterStore,
    equipment: &str,
) -> AppResult<String> {
    let stored = store
        .get(&format!("{}/port", settings_path(equipment)))?
        .and_then(|v| v.as_str().map(str::to_string));

    explicit
        .map(str::to_string)
        .or_else(|| configured.map(str::to_string))
        .or(stored)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            DaqError::Configuration(format!(
                "please set port device to {}/port",
                settings_path(equipment)
            ))
        })
}

/// Settings keys the adapter forwards to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    /// `output`
    Output,
    /// `shape`
    Shape,
    /// `frequency`
    Frequency,
    /// `Vhigh`
    VoltageHigh,
    /// `Vlow`
    VoltageLow,
    /// `pulse.width`
    PulseWidth,
}

impl SettingKey {
    /// Every forwarded key
    pub const ALL: [SettingKey; 6] = [
        SettingKey::Output,
        SettingKey::Shape,
        SettingKey::Frequency,
        SettingKey::VoltageHigh,
        SettingKey::VoltageLow,
        SettingKey::PulseWidth,
    ];

    /// Flattened key in the settings tree
    pub fn key(self) -> &'static str {
        match self {
            SettingKey::Output => "output",
            SettingKey::Shape => "shape",
            SettingKey::Frequency => "frequency",
            SettingKey::VoltageHigh => "Vhigh",
            SettingKey::VoltageLow => "Vlow",
            SettingKey::PulseWidth => "pulse.width",
        }
    }

    /// Inverse of [`SettingKey::key`]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.key() == key)
    }
}

/// Result of handling one setting change
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Path is not a recognized setting
    Ignored,
    /// Setter ran and the instrument reported no error
    Applied(SettingKey),
    /// Setter ran and the instrument's error register was nonzero
    InstrumentError(SettingKey, ErrorRecord),
}

/// One-shot instrument description for `sgen_frontend status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Manufacturer
    pub brand: String,
    /// Parsed `*IDN?` reply
    pub identity: Identity,
    /// Current instrument values
    pub snapshot: InstrumentSnapshot,
}

impl StatusReport {
    /// Identify the instrument and read every value once
    pub async fn collect(driver: &dyn SignalGenerator) -> AppResult<Self> {
        let identity = driver.identify().await?;
        let snapshot = InstrumentSnapshot {
            shape: driver.shape().await?,
            output: driver.output().await?,
            frequency: driver.frequency().await?,
            vhigh: driver.voltage_high().await?,
            vlow: driver.voltage_low().await?,
            pulse_width: driver.pulse_width().await?,
        };
        Ok(Self {
            brand: driver.brand().to_string(),
            identity,
            snapshot,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.snapshot;
        writeln!(f, "Brand:       {}", self.brand)?;
        writeln!(f, "Model:       {}", self.identity.model)?;
        writeln!(f, "Shape:       {}", s.shape)?;
        writeln!(f, "Frequency:   {} Hz", s.frequency)?;
        writeln!(f, "Vhigh:       {} V", s.vhigh)?;
        writeln!(f, "Vlow:        {} V", s.vlow)?;
        writeln!(f, "Pulse width: {} s", s.pulse_width)?;
        write!(f, "Output:      {}", if s.output { "ON" } else { "OFF" })
    }
}

/// Polling adapter between one signal generator and the parameter store
pub struct SignalGeneratorEquipment {
    name: String,
    driver: Box<dyn SignalGenerator>,
    store: Arc<dyn ParameterStore>,
    publisher: EventPublisher,
    settings: SettingsSchema,
    readback: ReadbackSchema,
    settings_path: String,
    readback_path: String,
    period: Duration,
}

impl SignalGeneratorEquipment {
    /// Adapter for `driver`, publishing under `/Equipment/{name}`
    pub fn new(
        name: &str,
        driver: Box<dyn SignalGenerator>,
        store: Arc<dyn ParameterStore>,
        publisher: EventPublisher,
        port: &str,
    ) -> Self {
        let mut settings = driver.settings_schema();
        settings.port = port.to_string();
        let readback = driver.readback_schema();
        Self {
            name: name.to_string(),
            driver,
            store,
            publisher,
            settings,
            readback,
            settings_path: settings_path(name),
            readback_path: readback_path(name),
            period: Duration::from_millis(5000),
        }
    }

    /// Polling period (default 5 s); clamped to at least [`MIN_PERIOD`]
    pub fn with_period(mut self, period: Duration) -> Self {
        if period < MIN_PERIOD {
            warn!(equipment = %self.name, ?period, "polling period too short, using {:?}", MIN_PERIOD);
        }
        self.period = period.max(MIN_PERIOD);
        self
    }

    /// Equipment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// In-memory settings tree
    pub fn settings(&self) -> &SettingsSchema {
        &self.settings
    }

    /// Last readback
    pub fn readback(&self) -> &ReadbackSchema {
        &self.readback
    }

    /// Store path of the settings tree
    pub fn settings_path(&self) -> &str {
        &self.settings_path
    }

    /// Store path of the readback tree
    pub fn readback_path(&self) -> &str {
        &self.readback_path
    }

    fn post(&self, message: OperatorMessage) {
        if let Err(e) = self.store.post_message(message) {
            warn!(equipment = %self.name, error = %e, "failed to post operator message");
        }
    }

    /// Write schema defaults for keys the store does not have yet
    pub fn seed_settings(&self) -> AppResult<()> {
        let existing = self
            .store
            .get(&self.settings_path)?
            .map(|v| flatten(&v))
            .unwrap_or_default();

        for (key, value) in flatten(&self.settings.to_value()?) {
            if !existing.contains_key(&key) {
                self.store.set(&join_path(&self.settings_path, &key), value)?;
            }
        }
        self.store.set(
            &join_path(&self.settings_path, "port"),
            Value::String(self.settings.port.clone()),
        )
    }

    /// Identify the instrument, reset it and publish the first snapshot
    pub async fn start(&mut self) -> AppResult<()> {
        self.seed_settings()?;

        let model = self.driver.model();
        let port = self.settings.port.clone();
        let identity = match self.driver.identify().await {
            Ok(identity) => identity,
            Err(e) => {
                self.post(OperatorMessage::error(format!("No device found on {}", port)));
                return Err(e);
            }
        };

        if identity.model != model.id() {
            self.post(OperatorMessage::error(format!(
                "SGEN {} not found on {}",
                model, port
            )));
            return Err(DaqError::IdentificationMismatch {
                expected: model.id().to_string(),
                found: identity.model,
                port,
            });
        }
        self.post(OperatorMessage::info(format!("SGEN {} found on {}", model, port)));

        self.driver.reset().await?;
        self.reconcile().await?;
        info!(equipment = %self.name, "equipment started");
        Ok(())
    }

    /// Read every value once; unreadable values keep their previous readback
    pub async fn read_snapshot(&self) -> InstrumentSnapshot {
        let previous = InstrumentSnapshot::from(&self.readback);

        let shape = match self.driver.shape().await {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => self.stale("shape", "empty reply", previous.shape.clone()),
            Err(e) => self.stale("shape", &e.to_string(), previous.shape.clone()),
        };
        let output = self
            .driver
            .output()
            .await
            .unwrap_or_else(|e| self.stale("output", &e.to_string(), previous.output));
        let frequency = self
            .driver
            .frequency()
            .await
            .unwrap_or_else(|e| self.stale("frequency", &e.to_string(), previous.frequency));
        let vhigh = self
            .driver
            .voltage_high()
            .await
            .unwrap_or_else(|e| self.stale("Vhigh", &e.to_string(), previous.vhigh));
        let vlow = self
            .driver
            .voltage_low()
            .await
            .unwrap_or_else(|e| self.stale("Vlow", &e.to_string(), previous.vlow));
        let pulse_width = self
            .driver
            .pulse_width()
            .await
            .unwrap_or_else(|e| self.stale("pulse.width", &e.to_string(), previous.pulse_width));

        InstrumentSnapshot {
            shape,
            output,
            frequency,
            vhigh,
            vlow,
            pulse_width,
        }
    }

    fn stale<T>(&self, key: &str, reason: &str, previous: T) -> T {
        warn!(equipment = %self.name, key, reason, "readback unavailable, keeping previous value");
        previous
    }

    /// Read the instrument and bring both store trees up to date
    pub async fn reconcile(&mut self) -> AppResult<InstrumentSnapshot> {
        let snapshot = self.read_snapshot().await;

        self.readback = ReadbackSchema::from(&snapshot);
        self.settings.apply(&snapshot);

        self.store
            .set(&self.readback_path, self.readback.to_value()?)?;

        let published = self.store.get(&self.settings_path)?.unwrap_or(Value::Null);
        let changes = changed_entries(&self.settings.to_value()?, &published);
        for (key, value) in changes {
            debug!(equipment = %self.name, key = %key, value = %value, "publishing setting");
            self.store.set(&join_path(&self.settings_path, &key), value)?;
        }
        Ok(snapshot)
    }

    /// One polling cycle: reconcile, then publish the data record
    pub async fn readout(&mut self) -> AppResult<DataRecord> {
        let snapshot = self.reconcile().await?;
        let record = DataRecord::from_snapshot(&self.name, &snapshot);
        let receivers = self.publisher.publish(record.clone());
        debug!(equipment = %self.name, func = record.func, receivers, "record published");
        Ok(record)
    }

    /// Forward an operator edit to the driver
    ///
    /// Invalid values are posted to the operator and returned as
    /// [`DaqError::InvalidValue`] without touching the instrument.
    pub async fn handle_change(&self, change: &SettingChange) -> AppResult<ChangeOutcome> {
        let Some(key) = relative_key(&self.settings_path, &change.path)
            .as_deref()
            .and_then(SettingKey::from_key)
        else {
            debug!(equipment = %self.name, path = %change.path, "ignoring change");
            return Ok(ChangeOutcome::Ignored);
        };

        if let Err(e) = self.apply(key, &change.value).await {
            if matches!(e, DaqError::InvalidValue { .. }) {
                self.post(OperatorMessage::error(e.to_string()));
            }
            return Err(e);
        }

        match self.driver.last_error().await {
            Ok(record) if record.is_error() => {
                self.post(OperatorMessage::error(record.line.clone()));
                Ok(ChangeOutcome::InstrumentError(key, record))
            }
            Ok(_) => Ok(ChangeOutcome::Applied(key)),
            Err(e) => {
                warn!(equipment = %self.name, error = %e, "could not read error register");
                Ok(ChangeOutcome::Applied(key))
            }
        }
    }

    async fn apply(&self, key: SettingKey, value: &Value) -> AppResult<()> {
        debug!(equipment = %self.name, key = key.key(), value = %value, "applying setting");
        match key {
            SettingKey::Output => self.driver.set_output(OutputState::from_value(value)?).await,
            SettingKey::Shape => {
                let shape = value
                    .as_str()
                    .and_then(|s| s.parse::<Shape>().ok())
                    .ok_or_else(|| invalid(key, value))?;
                self.driver.set_shape(shape).await
            }
            SettingKey::Frequency => self.driver.set_frequency(number(key, value)?).await,
            SettingKey::VoltageHigh => self.driver.set_voltage_high(number(key, value)?).await,
            SettingKey::VoltageLow => self.driver.set_voltage_low(number(key, value)?).await,
            SettingKey::PulseWidth => self.driver.set_pulse_width(number(key, value)?).await,
        }
    }

    /// Poll and dispatch until `shutdown` fires (or its sender is dropped)
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> AppResult<()> {
        let mut changes = self.store.watch(&self.settings_path)?;
        let mut watching = true;

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; start() already reconciled
        interval.tick().await;

        info!(equipment = %self.name, period_ms = self.period.as_millis() as u64, "polling started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.readout().await {
                        warn!(equipment = %self.name, error = %e, "readout failed");
                    }
                }
                change = changes.recv(), if watching => match change {
                    Some(change) => {
                        if let Err(e) = self.handle_change(&change).await {
                            warn!(equipment = %self.name, path = %change.path, error = %e, "setting change rejected");
                        }
                    }
                    None => {
                        warn!(equipment = %self.name, "settings watcher closed");
                        watching = false;
                    }
                },
                _ = &mut shutdown => {
                    info!(equipment = %self.name, "shutdown requested");
                    break;
                }
            }
        }
        info!(equipment = %self.name, "polling stopped");
        Ok(())
    }
}

/// `pulse.width` for `{settings}/pulse/width`; `None` outside `settings`
fn relative_key(settings: &str, path: &str) -> Option<String> {
    let base: Vec<&str> = settings.split('/').filter(|s| !s.is_empty()).collect();
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() <= base.len() || !parts.starts_with(&base) {
        return None;
    }
    Some(parts[base.len()..].join("."))
}

fn invalid(key: SettingKey, value: &Value) -> DaqError {
    DaqError::InvalidValue {
        parameter: key.key().to_string(),
        value: value.to_string(),
    }
}

fn number(key: SettingKey, value: &Value) -> AppResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{create_driver, FaultPolicy, ScpiSession};
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use serde_json::json;
    use tracing_test::traced_test;

    fn equipment(link: &MockTransport, store: Arc<MemoryStore>) -> SignalGeneratorEquipment {
        let session = ScpiSession::new(Box::new(link.clone()), FaultPolicy::Log);
        let driver = create_driver("33250A", session).unwrap();
        SignalGeneratorEquipment::new(
            "SGEN-33250A-00",
            driver,
            store,
            EventPublisher::default(),
            "/dev/ttyUSB0",
        )
    }

    #[test]
    fn test_equipment_name_and_paths() {
        assert_eq!(equipment_name("SGEN", "33250A", 0), "SGEN-33250A-00");
        assert_eq!(equipment_name("SGEN", "33250A", 12), "SGEN-33250A-12");
        assert_eq!(settings_path("SGEN-33250A-00"), "/Equipment/SGEN-33250A-00/Settings");
        assert_eq!(readback_path("SGEN-33250A-00"), "/Equipment/SGEN-33250A-00/Readback");
    }

    #[tokio::test]
    async fn test_zero_period_is_clamped() {
        let link = MockTransport::new();
        let mut eq = equipment(&link, Arc::new(MemoryStore::new())).with_period(Duration::ZERO);
        assert_eq!(eq.period, MIN_PERIOD);

        // sender dropped: the loop polls at least once more and returns
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { eq.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(shutdown_tx);
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn test_relative_key() {
        let base = "/Equipment/X/Settings";
        assert_eq!(relative_key(base, "/Equipment/X/Settings/Vhigh").as_deref(), Some("Vhigh"));
        assert_eq!(
            relative_key(base, "/Equipment/X/Settings/pulse/width").as_deref(),
            Some("pulse.width")
        );
        assert_eq!(relative_key(base, "/Equipment/X/Settings"), None);
        assert_eq!(relative_key(base, "/Equipment/Y/Settings/Vhigh"), None);
    }

    #[test]
    fn test_setting_keys_match_schema() {
        let flat = flatten(&ReadbackSchema::default().to_value().unwrap());
        for key in SettingKey::ALL {
            assert!(flat.contains_key(key.key()), "{} not in readback", key.key());
            assert_eq!(SettingKey::from_key(key.key()), Some(key));
        }
        assert_eq!(SettingKey::from_key("port"), None);
    }

    #[test]
    fn test_resolve_port_order() {
        let store = MemoryStore::new();
        store
            .set("/Equipment/E/Settings/port", json!("/dev/from-store"))
            .unwrap();

        assert_eq!(
            resolve_port(Some("/dev/cli"), Some("/dev/cfg"), &store, "E").unwrap(),
            "/dev/cli"
        );
        assert_eq!(resolve_port(None, Some("/dev/cfg"), &store, "E").unwrap(), "/dev/cfg");
        assert_eq!(resolve_port(None, None, &store, "E").unwrap(), "/dev/from-store");

        let err = resolve_port(None, None, &MemoryStore::new(), "E").unwrap_err();
        assert!(err
            .to_string()
            .contains("please set port device to /Equipment/E/Settings/port"));
    }

    #[tokio::test]
    async fn test_seed_preserves_operator_values() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("/Equipment/SGEN-33250A-00/Settings/frequency", json!(42.0))
            .unwrap();
        let link = MockTransport::new();
        let eq = equipment(&link, store.clone());

        eq.seed_settings().unwrap();
        let settings = store.get(eq.settings_path()).unwrap().unwrap();
        assert_eq!(settings["frequency"], json!(42.0));
        assert_eq!(settings["brand"], json!("Agilent"));
        assert_eq!(settings["model"], json!("33250A"));
        assert_eq!(settings["port"], json!("/dev/ttyUSB0"));
        assert_eq!(settings["pulse"]["width"], json!(0.0));
    }

    #[tokio::test]
    async fn test_start_resets_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let link = MockTransport::new();
        let mut eq = equipment(&link, store.clone());

        eq.start().await.unwrap();

        let writes = link.writes();
        assert_eq!(&writes[..2], &["*RST".to_string(), "*CLS".to_string()]);
        let readback = store.get(eq.readback_path()).unwrap().unwrap();
        assert_eq!(readback["shape"], json!("SIN"));
        assert_eq!(readback["frequency"], json!(1000.0));
        assert!(store
            .messages()
            .iter()
            .any(|m| m.text == "SGEN 33250A found on /dev/ttyUSB0" && !m.is_error));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreadable_value_keeps_previous_readback() {
        let store = Arc::new(MemoryStore::new());
        let link = MockTransport::new();
        let mut eq = equipment(&link, store.clone());
        eq.start().await.unwrap();

        link.respond_to("FREQ?", "garbage");
        let snapshot = eq.reconcile().await.unwrap();

        assert_eq!(snapshot.frequency, 1000.0);
        assert_eq!(eq.readback().frequency, 1000.0);
        assert!(logs_contain("keeping previous value"));
    }

    #[tokio::test]
    async fn test_unrecognized_path_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let link = MockTransport::new();
        let eq = equipment(&link, store);

        let outcome = eq
            .handle_change(&SettingChange {
                path: "/Equipment/SGEN-33250A-00/Settings/port".to_string(),
                value: json!("/dev/other"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::Ignored);
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn test_numeric_strings_are_accepted() {
        let store = Arc::new(MemoryStore::new());
        let link = MockTransport::new();
        let eq = equipment(&link, store);

        let outcome = eq
            .handle_change(&SettingChange {
                path: "/Equipment/SGEN-33250A-00/Settings/frequency".to_string(),
                value: json!("2500"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::Applied(SettingKey::Frequency));
        assert_eq!(link.writes(), vec!["FREQ 2500"]);
    }

    #[tokio::test]
    async fn test_status_report() {
        let link = MockTransport::new();
        let session = ScpiSession::new(Box::new(link), FaultPolicy::Propagate);
        let driver = create_driver("33250A", session).unwrap();

        let report = StatusReport::collect(driver.as_ref()).await.unwrap();
        assert_eq!(report.identity.model, "33250A");
        let text = report.to_string();
        assert!(text.contains("Brand:       Agilent"));
        assert!(text.contains("Output:      OFF"));
    }
}
