//! Tdlink CLI - run a test payload against the Test Driver
//!
//! Takes the serial endpoint, the test-data file and an output log path,
//! drives the full session and exits with an automation-friendly code.

use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tdlink::{exit_code_for, run_test_file, SessionOptions, TransporterConfig};

/// Tdlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "tdlink",
    version,
    about = "Serial transporter for the Test Driver",
    long_about = None
)]
struct Cli {
    /// Serial port of the Test Driver (e.g. COM1, /dev/ttyUSB0)
    port: String,

    /// Test data file (low level protocol file)
    input: PathBuf,

    /// Output log file; captured traces go to stdout when omitted
    log: Option<PathBuf>,

    /// Run the Test Driver in debug mode
    #[arg(long)]
    debug: bool,

    /// Turn trace timestamps off
    #[arg(long)]
    timestamps_off: bool,

    /// Disable auto-compression of large test-data files
    #[arg(long)]
    no_auto_compress: bool,

    /// Auto-compression threshold in bytes
    #[arg(long)]
    threshold: Option<u64>,

    /// Override the serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Load tunables from a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose protocol logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => match TransporterConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error: could not load config {}: {}", path.display(), e);
                return ExitCode::from(tdlink::ExitCodes::INVALID_ARGS);
            }
        },
        None => TransporterConfig::default(),
    };
    if cli.no_auto_compress {
        cfg.auto_compression = false;
    }
    if let Some(threshold) = cli.threshold {
        cfg.compress_threshold_bytes = threshold;
    }
    if let Some(baud) = cli.baud {
        cfg.baud_rate = baud;
    }

    let sink: Option<Box<dyn Write + Send>> = match &cli.log {
        Some(log) => match File::create(log) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                eprintln!("Error: could not create log file {}: {}", log.display(), e);
                return ExitCode::from(tdlink::ExitCodes::INVALID_ARGS);
            }
        },
        None => None,
    };

    let options = SessionOptions {
        debug_mode: cli.debug,
        timestamps_off: cli.timestamps_off,
    };

    match run_test_file(&cli.port, &cli.input, options, cfg, sink) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
