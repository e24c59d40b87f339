//! CAN Stream CLI Application
//!
//! Command-line front end for the can-stream-core pipeline. It adds:
//! - Frame sources (CSV replay, simulated traffic)
//! - Configuration files (config.toml) for triggers and recording
//! - Trigger actions: CSV recording, JSON snapshots, log output
//! - A live traffic monitor with bus load estimate
//! - An end-of-session summary (text or JSON)

use anyhow::{Context, Result};
use can_stream_core::signals::dbc::load_dbc_file;
use can_stream_core::{FrameDatabase, Pipeline, RecordingMode};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

mod config;
mod monitor;
mod replay;
mod simulate;
mod traffic;

use config::{AppConfig, RecordingConfig};
use monitor::{Monitor, MonitorOptions};
use replay::ReplaySource;
use simulate::SimulatedSource;

/// CAN Stream - Decode, analyze and trigger on live CAN traffic
#[derive(Parser, Debug)]
#[command(name = "can-stream-cli")]
#[command(about = "Real-time CAN signal decoding, analysis and triggering", long_about = None)]
#[command(version)]
struct Args {
    /// Path to DBC file(s) (can be repeated)
    #[arg(long, value_name = "FILE")]
    dbc: Vec<PathBuf>,

    /// Replay a raw CSV recording as the frame source
    #[arg(short, long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Pace replayed frames by their recorded timestamps
    #[arg(long)]
    realtime: bool,

    /// Generate synthetic traffic for every frame in the DBC
    #[arg(long, conflicts_with = "replay")]
    simulate: bool,

    /// Simulated frame rate across all frames
    #[arg(long, value_name = "HZ", default_value_t = 100.0)]
    rate: f64,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Record frames to CSV files in this directory
    #[arg(long, value_name = "DIR")]
    record_dir: Option<PathBuf>,

    /// Recording mode: raw or decoded
    #[arg(long, value_name = "MODE", value_parser = parse_recording_mode)]
    record_mode: Option<RecordingMode>,

    /// Stop after this many seconds
    #[arg(short, long, value_name = "SECS", value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Print the session summary as JSON
    #[arg(long)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_recording_mode(s: &str) -> std::result::Result<RecordingMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "raw" => Ok(RecordingMode::Raw),
        "decoded" => Ok(RecordingMode::Decoded),
        other => Err(format!("unknown recording mode '{}' (expected raw or decoded)", other)),
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("duration must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{}", e))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Stream CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using core library v{}", can_stream_core::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let replay = replay::replay_path(args.replay.as_ref(), config.input.replay.as_ref());
    if replay.is_none() && !args.simulate {
        println!("CAN Stream - No input specified");
        println!("\nQuick Start:");
        println!("  can-stream-cli --dbc vehicle.dbc --replay session.csv");
        println!("  can-stream-cli --dbc vehicle.dbc --simulate --duration 10");
        println!("\nWith triggers and recording:");
        println!("  can-stream-cli --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    let dbc_files: Vec<PathBuf> = args
        .dbc
        .iter()
        .chain(config.input.dbc_files.iter())
        .cloned()
        .collect();
    let database = load_databases(&dbc_files)?;

    let pipeline = Pipeline::new(database, config.pipeline.clone());
    for trigger in &config.triggers {
        pipeline
            .add_trigger(trigger.clone())
            .with_context(|| format!("Failed to add trigger '{}'", trigger.name))?;
    }
    pipeline
        .validate_triggers()
        .context("Triggers reference signals missing from the DBC")?;

    let options = MonitorOptions {
        refresh: config
            .display
            .refresh_interval()
            .context("display.refresh_hz must be a positive rate")?,
        duration: args.duration,
        recording: recording_config(&args, &config),
        display_signals: config.display.signals.clone(),
        bitrate: config.input.bitrate,
    };
    let mut monitor = Monitor::new(&pipeline, options);

    log::info!("Session started at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    let handle = match replay {
        Some(path) => {
            let source = ReplaySource::open(&path, args.realtime || config.input.realtime)
                .with_context(|| format!("Failed to open replay file {:?}", path))?;
            pipeline.start(source)?
        }
        None => pipeline.start(SimulatedSource::new(&pipeline.database(), args.rate)?)?,
    };

    let summary = monitor.run(handle)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        monitor::print_summary(&summary);
    }

    Ok(())
}

/// Load and merge every DBC file into one database
fn load_databases(paths: &[PathBuf]) -> Result<FrameDatabase> {
    let mut database = FrameDatabase::new();
    for path in paths {
        log::info!("Loading DBC: {:?}", path);
        let loaded = load_dbc_file(path).with_context(|| format!("Error loading DBC {:?}", path))?;
        database
            .merge(loaded)
            .with_context(|| format!("Conflicting definitions in {:?}", path))?;
    }

    let stats = database.stats();
    log::info!(
        "Signal database: {} frame(s), {} signal(s), {} multiplexed",
        stats.num_frames,
        stats.num_signals,
        stats.num_multiplexed
    );
    Ok(database)
}

/// Command-line recording options override the config file
fn recording_config(args: &Args, config: &AppConfig) -> Option<RecordingConfig> {
    let mut recording = match (&args.record_dir, &config.recording) {
        (Some(dir), Some(configured)) => RecordingConfig {
            output_dir: dir.clone(),
            ..configured.clone()
        },
        (Some(dir), None) => RecordingConfig::new(dir, RecordingMode::Raw),
        (None, configured) => configured.clone()?,
    };
    if let Some(mode) = args.record_mode {
        recording.mode = mode;
    }
    Some(recording)
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
