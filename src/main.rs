//! CLI Entry Point for the signal generator frontend
//!
//! Provides:
//! - `run` (default): identify the instrument, then poll and publish until Ctrl+C.
//!   Operator edits arrive as `set <path> <value>` lines on stdin or as edits
//!   of the store snapshot file.
//! - `status`: identify the instrument and print its current state once
//!
//! # Usage
//!
//! ```bash
//! sgen_frontend --model 33250A -i 0 --port /dev/ttyUSB0
//! sgen_frontend --model 33250A -i 0 --simulate
//! echo "set frequency 2500" | sgen_frontend --model 33250A -i 0 --simulate
//! sgen_frontend --model 33250A --port /dev/ttyUSB0 status
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sgen_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use sgen_daq::control::{run_console, SnapshotWatcher};
use sgen_daq::driver::{create_driver, FaultPolicy, ScpiSession, SgenModel};
use sgen_daq::equipment::{equipment_name, resolve_port, SignalGeneratorEquipment, StatusReport};
use sgen_daq::error::{AppResult, DaqError};
use sgen_daq::event::{spawn_json_lines_writer, EventPublisher};
use sgen_daq::logging::{self, TracingConfig};
use sgen_daq::registry::InstanceRegistry;
use sgen_daq::store::{MemoryStore, OperatorMessage, ParameterStore};
use sgen_daq::transport::{MockTransport, SerialTransport, Transport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "sgen_frontend")]
#[command(about = "Signal generator frontend (SCPI over serial)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Instrument model, e.g. 33250A
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Frontend index, used to build the equipment name
    #[arg(short, long, global = true)]
    index: Option<u32>,

    /// Serial port device
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Polling period in milliseconds
    #[arg(long, global = true)]
    period_ms: Option<u64>,

    /// Talk to the built-in instrument emulator instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Do not read `set <path> <value>` lines from stdin
    #[arg(long, global = true)]
    no_console: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Poll the instrument and publish settings/readback until Ctrl+C
    Run,
    /// Print the instrument state once and exit
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("sgen_frontend: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => runtime.block_on(run_frontend(&cli)),
        Commands::Status => runtime.block_on(print_status(&cli)),
    };
    // a pending stdin read cannot be cancelled
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "frontend stopped");
            eprintln!("sgen_frontend: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load settings, apply CLI overrides and start logging
fn prepare(cli: &Cli) -> Result<Settings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut settings = Settings::load_from(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    if let Some(period_ms) = cli.period_ms {
        settings.frontend.period_ms = period_ms;
    }
    if cli.model.is_some() {
        settings.frontend.model = cli.model.clone();
    }
    if cli.index.is_some() {
        settings.frontend.index = cli.index;
    }
    settings.validate()?;

    let mut tracing = TracingConfig::from_settings(&settings)?;
    if cli.verbose {
        tracing = tracing.with_level(Level::DEBUG);
    }
    logging::init(tracing)?;
    Ok(settings)
}

fn model(settings: &Settings) -> AppResult<SgenModel> {
    settings
        .frontend
        .model
        .as_deref()
        .ok_or_else(|| DaqError::Configuration("set instrument model with -m option".to_string()))?
        .parse()
}

fn open_store(settings: &Settings) -> AppResult<MemoryStore> {
    match &settings.store.snapshot_path {
        Some(path) => MemoryStore::load(path),
        None => Ok(MemoryStore::new()),
    }
}

fn port(cli: &Cli, settings: &Settings, store: &dyn ParameterStore, name: &str) -> AppResult<String> {
    match resolve_port(cli.port.as_deref(), settings.serial.port.as_deref(), store, name) {
        Ok(port) => Ok(port),
        Err(_) if cli.simulate => Ok("simulated".to_string()),
        Err(e) => Err(e),
    }
}

fn open_transport(cli: &Cli, settings: &Settings, port: &str) -> AppResult<Box<dyn Transport>> {
    if cli.simulate {
        info!(port, "using instrument emulator");
        return Ok(Box::new(MockTransport::new().with_resource(port)));
    }
    Ok(Box::new(SerialTransport::open(port, &settings.serial)?))
}

async fn run_frontend(cli: &Cli) -> Result<()> {
    let settings = prepare(cli)?;
    let model = model(&settings)?;
    let index = settings
        .frontend
        .index
        .ok_or_else(|| DaqError::Configuration("set frontend index with -i option".to_string()))?;
    let name = equipment_name(&settings.frontend.equipment_prefix, model.id(), index);

    let registry = InstanceRegistry::new(settings.store.runtime_dir());
    let _lock = registry.acquire(&name)?;

    let store = Arc::new(open_store(&settings)?);
    let port = port(cli, &settings, store.as_ref(), &name)?;

    let transport = match open_transport(cli, &settings, &port) {
        Ok(transport) => transport,
        Err(e) => {
            store.post_message(OperatorMessage::error(format!("No device found on {}", port)))?;
            return Err(e.into());
        }
    };
    let session = ScpiSession::new(transport, settings.transport.fault_policy);
    let driver = create_driver(model.id(), session)?;

    let publisher = EventPublisher::default();
    let writer = settings
        .data
        .log_path
        .clone()
        .map(|path| spawn_json_lines_writer(publisher.subscribe(), path));

    let mut equipment =
        SignalGeneratorEquipment::new(&name, driver, store.clone(), publisher, &port)
            .with_period(settings.frontend.period());
    equipment.start().await?;

    // the snapshot on disk is the baseline operator edits are diffed against
    let watcher = match &settings.store.snapshot_path {
        Some(path) => {
            store.save(path)?;
            Some(SnapshotWatcher::spawn(store.clone(), path).await?)
        }
        None => None,
    };
    let console = (!cli.no_console).then(|| {
        let store = store.clone();
        let base = equipment.settings_path().to_string();
        tokio::spawn(async move {
            match run_console(BufReader::new(tokio::io::stdin()), store, &base).await {
                Ok(applied) => info!(applied, "console input closed"),
                Err(e) => warn!(error = %e, "console stopped"),
            }
        })
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl+C"),
        }
        let _ = shutdown_tx.send(());
    });

    info!(equipment = %name, port = %port, "frontend running, press Ctrl+C to stop");
    equipment.run(shutdown_rx).await?;

    drop(watcher);
    if let Some(console) = console {
        console.abort();
    }
    // closes the record channel so the data log task finishes
    drop(equipment);
    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "data log failed"),
            Err(e) => warn!(error = %e, "data log task panicked"),
        }
    }

    if let Some(path) = &settings.store.snapshot_path {
        store.save(path)?;
        info!(path = %path.display(), "parameter store saved");
    }
    Ok(())
}

async fn print_status(cli: &Cli) -> Result<()> {
    let settings = prepare(cli)?;
    let model = model(&settings)?;
    let name = equipment_name(
        &settings.frontend.equipment_prefix,
        model.id(),
        settings.frontend.index.unwrap_or(0),
    );

    let store = open_store(&settings)?;
    let port = port(cli, &settings, &store, &name)?;
    let transport = open_transport(cli, &settings, &port)?;
    let driver = create_driver(model.id(), ScpiSession::new(transport, FaultPolicy::Propagate))?;

    let report = StatusReport::collect(driver.as_ref()).await?;
    if report.identity.model != driver.model().id() {
        return Err(DaqError::IdentificationMismatch {
            expected: driver.model().id().to_string(),
            found: report.identity.model,
            port,
        }
        .into());
    }
    let running = InstanceRegistry::new(settings.store.runtime_dir()).is_running(&name);
    println!(
        "{} on {} (frontend {})",
        name,
        port,
        if running { "running" } else { "not running" }
    );
    println!("{}", report);
    Ok(())
}
