//! `digi-daq`: command-line front end of the digitizer readout stack.
//!
//! ```bash
//! digi-daq run --config config/run.toml --duration 30s
//! digi-daq calibration calib/board_100.txt
//! digi-daq check-config config/run.toml
//! ```
//!
//! `run` drives simulated boards; it exercises the full pipeline without
//! hardware.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_board::{Calibration, SimBusFactory, SimLayout, SimParams};
use daq_core::{ErrorKind, RunConfig};
use daq_readout::{BoardManager, Command, CommandResponse};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "digi-daq")]
#[command(about = "Readout, decoding and recording for V1724 digitizer arrays", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline against simulated boards
    Run {
        /// Run configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// How long to acquire
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        duration: Duration,

        /// Interval between rate reports
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
        report_every: Duration,

        /// Simulated trigger rate per board
        #[arg(long, default_value_t = 1000.0)]
        trigger_rate: f64,

        /// Sample words per channel and trigger
        #[arg(long, default_value_t = 32)]
        words_per_channel: usize,
    },

    /// Print a calibration file
    Calibration {
        file: PathBuf,
    },

    /// Load and validate a run configuration
    CheckConfig {
        file: PathBuf,
    },
}

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            report_every,
            trigger_rate,
            words_per_channel,
        } => {
            let config = load_config(&config)?;
            init_tracing(&config.log_level, cli.log_json);
            let params = SimParams {
                layout: SimLayout::for_processing(&config.processing),
                trigger_rate_hz: trigger_rate,
                words_per_channel,
                ..SimParams::default()
            };
            run(config, params, duration, report_every)
        }
        Commands::Calibration { file } => {
            init_tracing("warn", cli.log_json);
            let calibration = Calibration::load(&file)
                .with_context(|| format!("reading calibration file {}", file.display()))?;
            match calibration.created_at() {
                Some(at) => println!("# {} (created {})", file.display(), at.format("%Y-%m-%d %H:00")),
                None => println!("# {} (unparseable stamp)", file.display()),
            }
            print!("{}", calibration);
            Ok(())
        }
        Commands::CheckConfig { file } => {
            init_tracing("warn", cli.log_json);
            let config = load_config(&file)?;
            println!(
                "{}: ok ({} digitizers, controller: {}, {} workers)",
                file.display(),
                config.digitizers().count(),
                config.controller().map_or("none".to_string(), |c| c.id.to_string()),
                config.processing.workers,
            );
            print!(
                "{}",
                toml::to_string_pretty(&config).context("rendering effective configuration")?
            );
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load_from(path).with_context(|| format!("loading {}", path.display()))
}

fn expect_accepted(response: CommandResponse) -> Result<()> {
    if !response.accepted {
        bail!("{} (state {})", response.message, response.state);
    }
    Ok(())
}

fn run(config: RunConfig, params: SimParams, duration: Duration, report_every: Duration) -> Result<()> {
    let run_name = config.run_name.clone();
    let mut manager = BoardManager::new(Arc::new(SimBusFactory::new(params)));
    info!(run = %run_name, duration = %humantime::format_duration(duration), "Starting run");

    expect_accepted(manager.handle(Command::Arm(config)))?;
    expect_accepted(manager.handle(Command::Start))?;

    let started = Instant::now();
    while started.elapsed() < duration {
        let remaining = duration.saturating_sub(started.elapsed());
        thread::sleep(report_every.min(remaining));
        let rate = manager.rate();
        info!(
            mb_per_sec = format_args!("{:.2}", rate.bytes_per_sec / 1e6),
            events_per_sec = format_args!("{:.0}", rate.events_per_sec),
            "Rate"
        );
        if let Some(kind) = manager.run_error() {
            warn!(error = %kind, "Run reports an error");
        }
    }

    let stopped = manager.handle(Command::Stop);
    let stats = manager.stats();
    info!(
        events = stats.events,
        occurrences = stats.occurrences,
        bytes = stats.bytes,
        decode_anomalies = stats.decode_anomalies,
        clock_anomalies = stats.clock_anomalies,
        dropped_batches = stats.dropped_batches,
        "Run summary"
    );
    for board in &stats.boards {
        info!(
            board = board.board,
            read_cycles = board.read_cycles,
            bytes = board.bytes,
            bus_errors = board.bus_errors,
            bad_blocks = board.bad_blocks,
            "Board summary"
        );
    }
    let error = manager.run_error();
    expect_accepted(manager.handle(Command::Sleep))?;
    expect_accepted(stopped)?;

    match error {
        Some(ErrorKind::DecodeAnomaly) => {
            warn!(run = %run_name, "Run finished with undecodable regions skipped");
        }
        Some(kind) => bail!("run {} finished with error: {}", run_name, kind),
        None => {}
    }
    Ok(())
}
