// Module declarations for the bridge's core components
pub mod config;        // Configuration management
pub mod coordinator;   // Polls plants and builds reports
pub mod error;         // Protocol error types
pub mod options;       // Command line options parsing
pub mod prelude;       // Common imports and types
pub mod registry;      // Discovered inverters and their latest values
pub mod report_writer; // JSON line output
pub mod sma;           // SMA Bluetooth protocol implementation
pub mod utils;         // Utility functions

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::coordinator::Coordinator;
use crate::prelude::*;
use crate::report_writer::ReportWriter;

use std::io::Write;

/// Installs the bridge's log format. Later calls are ignored.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Main application entry point
///
/// Loads the configuration, polls every enabled plant once and writes one
/// report line per identified inverter.
pub async fn app(options: Options) -> Result<()> {
    let config = match Config::new(&options.config_file) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            return Err(err.context("Failed to load config"));
        }
    };

    init_logging(&config.loglevel);
    info!("sma-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);
    config.log_summary();

    let writer = ReportWriter::new(config.report_file.as_deref())?;
    let coordinator = Coordinator::new(config);

    let results = tokio::select! {
        results = coordinator.poll(options.plant.as_deref()) => results?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            return Ok(());
        }
    };

    let mut failed = Vec::new();
    for (plant, result) in results {
        match result {
            Ok(reports) => {
                info!("plant {}: {} inverter(s) reported", plant, reports.len());
                for report in &reports {
                    writer.write(report)?;
                }
            }
            Err(err) => {
                error!("{:#}", err);
                failed.push(plant);
            }
        }
    }

    info!("{} report(s) written", writer.reports_written());

    if !failed.is_empty() {
        bail!("polling failed for {}", failed.join(", "));
    }

    Ok(())
}
