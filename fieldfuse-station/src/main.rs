//! FieldFuse Station Daemon
//!
//! Merges the push, wireless and bus sensor channels with bracketed still
//! captures and appends one row per frame to the record log.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file
//! fieldfuse-station --config /etc/fieldfuse/station.toml
//!
//! # Commissioning: one immediate merge/capture/persist cycle
//! fieldfuse-station --config station.toml --once --log-level debug
//!
//! # Print the record log header
//! fieldfuse-station --print-header
//! ```
//!
//! Wireless and bus channels need the `ble` and `i2c` features
//! (`--features raspberry-pi` enables both).

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fieldfuse_connectors::{PushSource, RpicamStill};
use fieldfuse_core::{
    record, CaptureController, Clock, Coordinator, CsvSink, SensorSource, SetupError, StopSignal, SystemClock,
};

use crate::config::StationConfig;

/// FieldFuse field-station daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Station configuration file
    #[arg(short, long, default_value = "/etc/fieldfuse/station.toml")]
    config: PathBuf,

    /// Log filter, overrides the config file (RUST_LOG overrides both)
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single cycle immediately, then exit
    #[arg(long)]
    once: bool,

    /// Print the record log header and exit
    #[arg(long)]
    print_header: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_header {
        println!("{}", record::header());
        return Ok(());
    }

    let config = StationConfig::load(&cli.config)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.station.log_level));

    info!("FieldFuse station {} starting", fieldfuse_core::VERSION);
    info!("  Location: {}", config.station.location);
    info!("  Record log: {}", config.csv_path().display());
    info!("  Images: {}", config.station.image_dir.display());

    let stop = StopSignal::new();
    let mut coordinator = build(&config, stop.clone())?;

    let once = cli.once;
    let mut worker = tokio::task::spawn_blocking(move || {
        if once {
            coordinator.run_once()
        } else {
            coordinator.run()
        }
    });

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = shutdown_signal() => {
            info!("Shutdown requested, stopping all loops");
            stop.cancel();
            worker.await
        }
    };

    let stats = joined.context("Coordinator thread panicked")??;
    info!(
        "Stopped after {} cycle(s), {} row(s) written, {} bracket(s) abandoned",
        stats.cycles, stats.rows_written, stats.brackets_abandoned
    );
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

fn require_dir(path: &Path) -> Result<(), SetupError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(SetupError::MissingDirectory(path.to_path_buf()))
    }
}

/// Setup checks and wiring; any failure here stops the process
fn build(config: &StationConfig, stop: StopSignal) -> Result<Coordinator<RpicamStill>> {
    let station = &config.station;
    require_dir(&station.data_dir)?;
    require_dir(&station.image_dir)?;

    let csv_path = config.csv_path();
    CsvSink::prepare(&csv_path).with_context(|| format!("Cannot prepare {}", csv_path.display()))?;
    let sink = CsvSink::open(&csv_path).with_context(|| format!("Cannot open {}", csv_path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(station.timezone));

    let mut capture = CaptureController::new(
        RpicamStill::new(config.camera()),
        &station.image_dir,
        &station.location,
        clock.clone(),
        stop.clone(),
    )
    .with_settle(config.settle());
    capture.probe().map_err(|e| SetupError::Device(format!("camera: {e}")))?;

    let mut coordinator = Coordinator::new(capture, Box::new(sink), clock.clone(), stop)
        .with_schedule(config.schedule_table()?)
        .with_policy(config.policy());

    for source in sources(config, &clock)? {
        info!("  Source: {}", source.name());
        coordinator = coordinator.with_source(source);
    }
    Ok(coordinator)
}

/// Sources in merge order: push, wireless, bus
fn sources(config: &StationConfig, clock: &Arc<dyn Clock>) -> Result<Vec<Arc<dyn SensorSource>>> {
    let mut sources: Vec<Arc<dyn SensorSource>> = Vec::new();

    if config.mqtt.enabled {
        let push = PushSource::new(config.mqtt()?, &config.station.image_dir, clock.clone());
        sources.push(Arc::new(push));
    }

    if config.ble.enabled {
        #[cfg(feature = "ble")]
        {
            use fieldfuse_connectors::ble::BtleplugConnector;
            use fieldfuse_connectors::WirelessSource;

            let wireless = WirelessSource::new(config.wireless(), BtleplugConnector::new(), clock.clone());
            sources.push(Arc::new(wireless));
        }
        #[cfg(not(feature = "ble"))]
        warn!("Built without BLE support, wireless source disabled");
    }

    if config.bus.enabled {
        #[cfg(feature = "i2c")]
        {
            use fieldfuse_connectors::bus::{open_linux, BusSource};

            let sensor = open_linux(&config.bus.device, config.bus.address)?;
            sources.push(Arc::new(BusSource::new(sensor, clock.clone())));
        }
        #[cfg(not(feature = "i2c"))]
        warn!("Built without I2C support, light sensor disabled");
    }

    Ok(sources)
}
