//! CLI entry point for daq-scan
//!
//! Runs scan descriptions against the simulated devices listed in the
//! application settings.
//!
//! # Usage
//!
//! Run a scan:
//! ```bash
//! daq-scan run config/scans/theta_line.toml
//! ```
//!
//! List the available drivers:
//! ```bash
//! daq-scan drivers
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use daq_scan::logging::{self, OutputFormat, TracingConfig};
use daq_scan::registry::DriverClass;
use daq_scan::settings::Settings;
use daq_scan::sink::bump_version;
use daq_scan::{DriverRegistry, ScanConfig, ScanEngine};

#[derive(Parser)]
#[command(name = "daq-scan")]
#[command(about = "Step-scan engine for motorized data acquisition", long_about = None)]
struct Cli {
    /// Settings file under config/, without extension
    #[arg(long, global = true)]
    settings: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan description once
    Run {
        /// Path to the scan TOML file
        scan: PathBuf,
    },

    /// List built-in and registered driver types
    Drivers,

    /// Print the next version of a datafile name
    Bump {
        /// Datafile name ending in a version number
        filename: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::new(cli.settings.as_deref()).context("Failed to load settings")?;
    logging::init(TracingConfig::from_settings(&settings)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Run { scan } => run_scan(&settings, scan).await,
        Commands::Drivers => {
            list_drivers(&settings);
            Ok(())
        }
        Commands::Bump { filename } => {
            println!("{}", bump_version(&filename)?);
            Ok(())
        }
    }
}

async fn run_scan(settings: &Settings, path: PathBuf) -> Result<()> {
    let config = ScanConfig::load(&path)
        .with_context(|| format!("Failed to load scan '{}'", path.display()))?;
    let records = Arc::new(settings.mock_records());
    let registry = Arc::new(DriverRegistry::new().with_plot_command(settings.plot_command.clone()));

    let mut engine = ScanEngine::new(config, records).with_registry(registry);

    let interrupt = engine.interrupt();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, aborting scan");
            interrupt.request_abort();
        }
    });

    info!(scan = %path.display(), "Running scan");
    let report = engine.perform_scan().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn list_drivers(settings: &Settings) {
    let registry = DriverRegistry::new().with_plot_command(settings.plot_command.clone());
    for class in [
        DriverClass::Measurement,
        DriverClass::Datafile,
        DriverClass::Plot,
        DriverClass::Permit,
        DriverClass::Fault,
    ] {
        println!("{class}: {}", registry.list_types(class).join(", "));
    }
}
