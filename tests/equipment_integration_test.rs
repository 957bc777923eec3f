//! End-to-end tests for the signal generator equipment against the emulated
//! instrument and the in-memory parameter store.

use serde_json::{json, Value};
use sgen_daq::control::{run_console, SnapshotWatcher};
use sgen_daq::driver::{create_driver, FaultPolicy, ScpiSession};
use sgen_daq::equipment::{ChangeOutcome, SettingKey, SignalGeneratorEquipment};
use sgen_daq::error::{AppResult, DaqError};
use sgen_daq::event::EventPublisher;
use sgen_daq::registry::InstanceRegistry;
use sgen_daq::store::{MemoryStore, OperatorMessage, ParameterStore, SettingChange};
use sgen_daq::transport::MockTransport;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_test::{assert_err, assert_ok};

const NAME: &str = "SGEN-33250A-00";
const PORT: &str = "/dev/ttyUSB0";

/// Store wrapper that records every `set` path
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    sets: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn sets(&self) -> Vec<String> {
        self.sets.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.sets.lock().unwrap().clear();
    }
}

impl ParameterStore for RecordingStore {
    fn get(&self, path: &str) -> AppResult<Option<Value>> {
        self.inner.get(path)
    }

    fn set(&self, path: &str, value: Value) -> AppResult<()> {
        self.sets.lock().unwrap().push(path.to_string());
        self.inner.set(path, value)
    }

    fn post_message(&self, message: OperatorMessage) -> AppResult<()> {
        self.inner.post_message(message)
    }

    fn watch(&self, prefix: &str) -> AppResult<mpsc::UnboundedReceiver<SettingChange>> {
        self.inner.watch(prefix)
    }
}

/// Store whose `set` fails while `failing` is raised
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl ParameterStore for FlakyStore {
    fn get(&self, path: &str) -> AppResult<Option<Value>> {
        self.inner.get(path)
    }

    fn set(&self, path: &str, value: Value) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(DaqError::Store("store unavailable".to_string()));
        }
        self.inner.set(path, value)
    }

    fn post_message(&self, message: OperatorMessage) -> AppResult<()> {
        self.inner.post_message(message)
    }

    fn watch(&self, prefix: &str) -> AppResult<mpsc::UnboundedReceiver<SettingChange>> {
        self.inner.watch(prefix)
    }
}

fn build(
    link: &MockTransport,
    store: Arc<dyn ParameterStore>,
    publisher: EventPublisher,
) -> SignalGeneratorEquipment {
    build_with_policy(link, store, publisher, FaultPolicy::Log)
}

fn build_with_policy(
    link: &MockTransport,
    store: Arc<dyn ParameterStore>,
    publisher: EventPublisher,
    policy: FaultPolicy,
) -> SignalGeneratorEquipment {
    let session = ScpiSession::new(Box::new(link.clone()), policy);
    let driver = create_driver("33250A", session).unwrap();
    SignalGeneratorEquipment::new(NAME, driver, store, publisher, PORT)
}

/// Wait until every command in `expected` has been written to the link
async fn wait_for_writes(link: &MockTransport, expected: &[&str]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let writes = link.writes();
            if expected.iter().all(|e| writes.iter().any(|w| w == e)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("missing writes {:?}, got {:?}", expected, link.writes()));
}

fn settings(key: &str) -> String {
    format!("/Equipment/{}/Settings/{}", NAME, key)
}

fn change(key: &str, value: Value) -> SettingChange {
    SettingChange {
        path: settings(key),
        value,
    }
}

#[tokio::test]
async fn test_pulse_readout_end_to_end() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = EventPublisher::default();
    let mut records = publisher.subscribe();
    let mut eq = build(&link, store.clone(), publisher);
    assert_ok!(eq.start().await);

    link.respond_to("FUNC?", "PULS");
    link.respond_to("FREQ?", "1000.0");
    link.respond_to("VOLT:HIGH?", "5.0");
    link.respond_to("VOLT:LOW?", "0.0");
    link.respond_to(":OUTP?", "1");
    link.respond_to("PULSE:WIDTH?", "0.002");

    let record = eq.readout().await.unwrap();
    assert_eq!(record.func, 3);
    assert_eq!(record.para, [1000.0, 5.0, 0.0, 1.0, 0.002, 0.0, 0.0, 0.0]);
    assert_eq!(records.recv().await.unwrap(), record);

    let readback = store.get(eq.readback_path()).unwrap().unwrap();
    assert_eq!(readback["shape"], json!("PULS"));
    assert_eq!(readback["output"], json!(true));
    assert_eq!(readback["frequency"], json!(1000.0));
    assert_eq!(readback["Vhigh"], json!(5.0));
    assert_eq!(readback["Vlow"], json!(0.0));
    assert_eq!(readback["pulse"]["width"], json!(0.002));

    // settings mirror the same snapshot, identity untouched
    let published = store.get(eq.settings_path()).unwrap().unwrap();
    assert_eq!(published["shape"], json!("PULS"));
    assert_eq!(published["Vhigh"], json!(5.0));
    assert_eq!(published["brand"], json!("Agilent"));
    assert_eq!(published["port"], json!(PORT));
}

#[tokio::test]
async fn test_only_changed_setting_is_published() {
    let link = MockTransport::new();
    link.respond_to("VOLT:HIGH?", "2.0");
    link.respond_to("FREQ?", "1000");
    let store = Arc::new(RecordingStore::default());
    let mut eq = build(&link, store.clone(), EventPublisher::default());
    assert_ok!(eq.start().await);

    store.clear();
    link.respond_to("VOLT:HIGH?", "2.5");
    eq.reconcile().await.unwrap();

    let sets = store.sets();
    let settings_sets: Vec<&String> = sets
        .iter()
        .filter(|p| p.starts_with(eq.settings_path()))
        .collect();
    assert_eq!(settings_sets, vec![&settings("Vhigh")]);
    assert!(sets.contains(&eq.readback_path().to_string()));

    // nothing changed, nothing published
    store.clear();
    eq.reconcile().await.unwrap();
    assert!(store
        .sets()
        .iter()
        .all(|p| !p.starts_with(eq.settings_path())));
}

#[tokio::test]
async fn test_reconcile_preserves_unrelated_readback_keys() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    store
        .set(
            &format!("/Equipment/{}/Readback/operator_note", NAME),
            json!("calibrated 2026-10-01"),
        )
        .unwrap();
    let mut eq = build(&link, store.clone(), EventPublisher::default());

    assert_ok!(eq.start().await);
    eq.reconcile().await.unwrap();

    let readback = store.get(eq.readback_path()).unwrap().unwrap();
    assert_eq!(readback["operator_note"], json!("calibrated 2026-10-01"));
    assert_eq!(readback["shape"], json!("SIN"));
}

#[tokio::test]
async fn test_identity_mismatch_is_fatal() {
    let link = MockTransport::new().with_identity("Agilent Technologies,33220A,0,2.0");
    let store = Arc::new(MemoryStore::new());
    let mut eq = build(&link, store.clone(), EventPublisher::default());

    let err = assert_err!(eq.start().await);
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        DaqError::IdentificationMismatch { ref expected, ref found, .. }
            if expected == "33250A" && found == "33220A"
    ));
    // no reset, no readback published
    assert!(link.writes().is_empty());
    assert!(!store.exists(eq.readback_path()).unwrap());

    let messages = store.messages();
    let last = messages.last().unwrap();
    assert!(last.is_error);
    assert_eq!(last.text, format!("SGEN 33250A not found on {}", PORT));
}

#[tokio::test]
async fn test_no_device_is_reported() {
    let link = MockTransport::new();
    link.set_offline(true);
    let store = Arc::new(MemoryStore::new());
    let mut eq = build(&link, store.clone(), EventPublisher::default());

    let err = assert_err!(eq.start().await);
    assert!(matches!(err, DaqError::TransportFailure { .. }));
    assert!(store
        .messages()
        .iter()
        .any(|m| m.is_error && m.text == format!("No device found on {}", PORT)));
}

#[tokio::test]
async fn test_invalid_shape_issues_no_write() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let eq = build(&link, store.clone(), EventPublisher::default());

    for value in [json!("TRI"), json!(3), json!(null)] {
        let err = assert_err!(eq.handle_change(&change("shape", value)).await);
        assert!(matches!(err, DaqError::InvalidValue { ref parameter, .. } if parameter == "shape"));
    }
    assert!(link.calls().is_empty());
    assert_eq!(store.messages().iter().filter(|m| m.is_error).count(), 3);
}

#[tokio::test]
async fn test_output_accepts_documented_tokens() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let eq = build(&link, store, EventPublisher::default());

    for value in [
        json!("ON"),
        json!("OFF"),
        json!(1),
        json!(0),
        json!("1"),
        json!("0"),
        json!(true),
        json!(1.0),
        json!(0.0),
    ] {
        let outcome = eq.handle_change(&change("output", value)).await.unwrap();
        assert_eq!(outcome, ChangeOutcome::Applied(SettingKey::Output));
    }
    assert_eq!(
        link.writes(),
        vec![
            ":OUTP ON",
            ":OUTP OFF",
            ":OUTP ON",
            ":OUTP OFF",
            ":OUTP ON",
            ":OUTP OFF",
            ":OUTP ON",
            ":OUTP ON",
            ":OUTP OFF"
        ]
    );

    link.clear_log();
    for value in [json!("MAYBE"), json!(2), json!("on "), json!({"x": 1})] {
        assert_err!(eq.handle_change(&change("output", value)).await);
    }
    assert!(link.writes().is_empty());
}

#[tokio::test]
async fn test_instrument_error_is_surfaced() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let eq = build(&link, store.clone(), EventPublisher::default());

    // Vhigh below the emulated Vlow of -0.05 V
    let outcome = eq.handle_change(&change("Vhigh", json!(-1.0))).await.unwrap();
    match outcome {
        ChangeOutcome::InstrumentError(SettingKey::VoltageHigh, record) => {
            assert_eq!(record.code, -222);
            assert_eq!(record.line, "-222,\"Data out of range\"");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let messages = store.messages();
    let last = messages.last().unwrap();
    assert!(last.is_error);
    assert_eq!(last.text, "-222,\"Data out of range\"");

    // the following change still goes through
    let outcome = eq.handle_change(&change("pulse/width", json!(0.002))).await.unwrap();
    assert_eq!(outcome, ChangeOutcome::Applied(SettingKey::PulseWidth));
}

#[tokio::test]
async fn test_run_loop_dispatches_edits_and_publishes() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = EventPublisher::default();
    let mut records = publisher.subscribe();
    let mut eq = build(&link, store.clone(), publisher).with_period(Duration::from_millis(20));
    assert_ok!(eq.start().await);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let result = eq.run(shutdown_rx).await;
        (eq, result)
    });

    // first record means the loop is running and watching
    let first = tokio::time::timeout(Duration::from_secs(2), records.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.func, 0);

    store.edit(&settings("frequency"), json!(2500.0)).unwrap();
    store.edit(&settings("shape"), json!("SQU")).unwrap();

    let updated = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let record = records.recv().await.unwrap();
            if record.para[0] == 2500.0 && record.func == 1 {
                return record;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(updated.equipment, NAME);

    shutdown_tx.send(()).unwrap();
    let (eq, result) = handle.await.unwrap();
    assert_ok!(result);
    assert_eq!(eq.readback().frequency, 2500.0);
    assert_eq!(eq.settings().shape, "SQU");
}

#[tokio::test]
async fn test_propagate_policy_keeps_stale_readback() {
    let link = MockTransport::new();
    link.respond_to("FREQ?", "1234.5");
    link.respond_to("VOLT:HIGH?", "3.0");
    let store = Arc::new(MemoryStore::new());
    let mut eq = build_with_policy(&link, store.clone(), EventPublisher::default(), FaultPolicy::Propagate);
    assert_ok!(eq.start().await);
    let before = store.get(eq.readback_path()).unwrap().unwrap();

    link.set_offline(true);
    let snapshot = assert_ok!(eq.reconcile().await);
    assert_eq!(snapshot.shape, "SIN");
    assert_eq!(snapshot.frequency, 1234.5);
    assert_eq!(snapshot.vhigh, 3.0);
    assert_eq!(store.get(eq.readback_path()).unwrap().unwrap(), before);
    assert_eq!(eq.readback().frequency, 1234.5);
}

#[tokio::test]
async fn test_propagate_policy_returns_write_failure_without_posting() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let mut eq = build_with_policy(&link, store.clone(), EventPublisher::default(), FaultPolicy::Propagate);
    assert_ok!(eq.start().await);
    let posted = store.messages().len();

    link.set_offline(true);
    let err = assert_err!(eq.handle_change(&change("frequency", json!(2500.0))).await);
    assert!(matches!(err, DaqError::TransportFailure { ref command, .. } if command == "FREQ 2500"));
    assert!(!err.is_fatal());
    assert_eq!(store.messages().len(), posted);
}

#[tokio::test]
async fn test_run_loop_survives_failing_readout() {
    let link = MockTransport::new();
    let store = Arc::new(FlakyStore::default());
    let publisher = EventPublisher::default();
    let mut records = publisher.subscribe();
    let mut eq = build(&link, store.clone(), publisher).with_period(Duration::from_millis(10));
    assert_ok!(eq.start().await);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { eq.run(shutdown_rx).await });
    tokio::time::timeout(Duration::from_secs(2), records.recv())
        .await
        .unwrap()
        .unwrap();

    store.failing.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.failures.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    store.failing.store(false, Ordering::SeqCst);
    while records.try_recv().is_ok() {}

    // published by a cycle after the failing ones
    let record = tokio::time::timeout(Duration::from_secs(2), records.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.equipment, NAME);

    shutdown_tx.send(()).unwrap();
    assert_ok!(handle.await.unwrap());
}

#[tokio::test]
async fn test_snapshot_file_edit_reaches_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odb.json");
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = EventPublisher::default();
    let mut records = publisher.subscribe();
    let mut eq = build(&link, store.clone(), publisher).with_period(Duration::from_millis(20));
    assert_ok!(eq.start().await);
    store.save(&path).unwrap();
    let watcher = SnapshotWatcher::spawn(store.clone(), &path).await.unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { eq.run(shutdown_rx).await });
    tokio::time::timeout(Duration::from_secs(2), records.recv())
        .await
        .unwrap()
        .unwrap();

    // operator edits two settings in the saved snapshot
    let mut tree: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    tree["Equipment"][NAME]["Settings"]["frequency"] = json!(2500.0);
    tree["Equipment"][NAME]["Settings"]["output"] = json!(1.0);
    std::fs::write(&path, serde_json::to_string_pretty(&tree).unwrap()).unwrap();

    wait_for_writes(&link, &["FREQ 2500", ":OUTP ON"]).await;
    // untouched settings are not replayed
    assert!(!link.writes().iter().any(|w| w.starts_with("FUNC ")));

    drop(watcher);
    shutdown_tx.send(()).unwrap();
    assert_ok!(handle.await.unwrap());
}

#[tokio::test]
async fn test_console_edit_reaches_instrument() {
    let link = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let publisher = EventPublisher::default();
    let mut records = publisher.subscribe();
    let mut eq = build(&link, store.clone(), publisher).with_period(Duration::from_millis(20));
    assert_ok!(eq.start().await);
    let base = eq.settings_path().to_string();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { eq.run(shutdown_rx).await });
    tokio::time::timeout(Duration::from_secs(2), records.recv())
        .await
        .unwrap()
        .unwrap();

    let input: &[u8] = b"set frequency 2500\nset output ON\nset shape TRI\n";
    let applied = run_console(tokio::io::BufReader::new(input), store.clone(), &base)
        .await
        .unwrap();
    assert_eq!(applied, 3);

    wait_for_writes(&link, &["FREQ 2500", ":OUTP ON"]).await;
    assert!(!link.writes().iter().any(|w| w.starts_with("FUNC ")));

    shutdown_tx.send(()).unwrap();
    assert_ok!(handle.await.unwrap());
}

#[test]
fn test_second_instance_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = InstanceRegistry::new(dir.path());

    let _lock = registry.acquire(NAME).unwrap();
    // another pid trying the same equipment name
    let err = registry.acquire_as(NAME, u32::MAX - 1).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        err.to_string(),
        format!("{} already running, please change frontend index", NAME)
    );

    // another index is fine
    assert_ok!(registry.acquire("SGEN-33250A-01"));
}
