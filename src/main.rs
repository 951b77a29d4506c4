//! CLI entry point for daq-session
//!
//! Provides command-line interface for:
//! - Streaming samples from a device over TCP or serial (`stream`)
//! - Finding network devices with a UDP broadcast probe (`discover`)
//! - Listing local serial ports (`ports`)
//!
//! # Usage
//!
//! Ten seconds of CSV from a network device, requiring at least 5000 rows:
//! ```bash
//! daq-session stream --host 192.168.1.40 --duration 10 --format csv --min-samples 5000
//! ```
//!
//! First 100 samples from a serial device, channels 0, 1 and 3 only:
//! ```bash
//! daq-session stream --serial /dev/ttyUSB0 --limit 100 --channels 1101
//! ```
//!
//! # Exit codes
//!
//! `0` success, `2` fewer samples than `--min-samples`, `1` everything else
//! (including usage errors).

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Args, Parser, Subcommand};
use daq_session::config::{OutputDestination, OutputFormat, SessionConfig, SessionDefaults, Target};
use daq_session::connection::DeviceConnector;
use daq_session::discovery;
use daq_session::error::{error_chain, SessionError};
use daq_session::logging::{self, LogFormat, LoggingConfig};
use daq_session::session::{relay_interrupts, SessionController};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "daq-session", version)]
#[command(about = "Stream samples from a data-acquisition device", long_about = None)]
struct Cli {
    /// Defaults file (TOML). `daq-session.toml` is used when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Diagnostic log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Diagnostic log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a device and stream samples
    Stream(StreamArgs),

    /// Broadcast a discovery probe and list answering devices
    Discover {
        /// How long to wait for replies, in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List local serial ports
    Ports,
}

#[derive(Args)]
struct StreamArgs {
    /// Network device host name or IP address
    #[arg(long)]
    host: Option<String>,

    /// Network device TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Serial device path (e.g. /dev/ttyUSB0, COM3)
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Sample rate in Hz
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    rate: Option<u32>,

    /// Stop after this many seconds (0 = until interrupted)
    #[arg(long, default_value = "0", value_parser = parse_seconds)]
    duration: Duration,

    /// Stop after this many samples (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// Exit with status 2 when fewer samples than this were received
    #[arg(long, default_value_t = 0)]
    min_samples: u64,

    /// Channel enable mask, one digit per ADC channel (e.g. 1101)
    #[arg(long = "channels")]
    channels: Option<String>,

    /// Data format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write data to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Per-attempt connect timeout in milliseconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Connect attempts before giving up
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    connect_attempts: Option<u32>,

    /// Leave the device connection open when the session ends
    #[arg(long)]
    keep_open: bool,

    /// Print device status frames on stderr
    #[arg(long)]
    show_status: bool,
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", raw))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{}': {}", raw, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Exit status 2 belongs to validation failures
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let defaults = match SessionDefaults::load(cli.config.as_deref()) {
        Ok(defaults) => defaults,
        Err(e) => return report(&e),
    };

    if let Err(e) = init_logging(&cli, &defaults) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Stream(args) => run_stream(args, &defaults).await,
        Commands::Discover { timeout } => run_discover(timeout, &defaults).await,
        Commands::Ports => run_ports(),
    }
}

fn init_logging(cli: &Cli, defaults: &SessionDefaults) -> Result<(), String> {
    let mut config =
        LoggingConfig::from_defaults(defaults)?.with_ansi(std::io::stderr().is_terminal());
    if let Some(level) = &cli.log_level {
        config = config.with_level(logging::parse_log_level(level)?);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config)
}

fn report(error: &SessionError) -> ExitCode {
    eprintln!("error: {}", error_chain(error));
    error.outcome().into()
}

fn session_config(args: StreamArgs, defaults: &SessionDefaults) -> Result<SessionConfig, SessionError> {
    let target = Target::from_parts(args.host, args.port, args.serial, args.baud, defaults)?;

    let mut retry = defaults.retry_policy();
    if let Some(ms) = args.connect_timeout {
        retry.timeout = Duration::from_millis(ms);
    }
    if let Some(attempts) = args.connect_attempts {
        retry.attempts = attempts;
    }

    let mut config = SessionConfig::new(target)
        .with_rate(args.rate.unwrap_or(defaults.rate))
        .with_duration(args.duration)
        .with_limit(args.limit)
        .with_min_samples(args.min_samples)
        .with_format(args.format)
        .with_retry(retry)
        .with_keep_open(args.keep_open)
        .with_show_status(args.show_status);
    if let Some(mask) = args.channels {
        config = config.with_channel_mask(mask);
    }
    if let Some(path) = args.output {
        config = config.with_destination(OutputDestination::File(path));
    }
    Ok(config)
}

async fn run_stream(args: StreamArgs, defaults: &SessionDefaults) -> ExitCode {
    let config = match session_config(args, defaults) {
        Ok(config) => config,
        Err(e) => return report(&e),
    };
    tracing::info!(device = %config.target, rate = config.rate, format = ?config.format, "Starting session");

    let controller = SessionController::from_config(config, Arc::new(DeviceConnector));

    // Ctrl-C stops the session; a second Ctrl-C abandons a hung teardown
    tokio::spawn(relay_interrupts(
        signal::ctrl_c,
        controller.cancellation_token(),
        || std::process::exit(1),
    ));

    controller.run_to_outcome().await.into()
}

async fn run_discover(timeout: Option<u64>, defaults: &SessionDefaults) -> ExitCode {
    let window = Duration::from_millis(timeout.unwrap_or(defaults.discovery_timeout_ms));
    match discovery::discover_network_devices(defaults.discovery_port, window).await {
        Ok(devices) if devices.is_empty() => {
            eprintln!("no devices found");
            ExitCode::SUCCESS
        }
        Ok(devices) => {
            for device in devices {
                println!("{}", device);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_ports() -> ExitCode {
    match discovery::list_serial_ports() {
        Ok(ports) => {
            for port in ports {
                println!("{}", port);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
