//! MAGNAV: demo command line interface for the magnetic anomaly navigation
//! stack.
//!
//! Two subcommands are provided. `simulate` emits a seeded random jitter
//! trajectory around the reference point as JSON, which is handy for
//! exercising downstream consumers without map data. `estimate` runs one
//! predict/update cycle of a fresh filter against a position observation
//! and prints the updated state; filter state is per-invocation (nothing
//! persists across processes).

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::info;
use serde_json::json;

use magnav::geo::LatLon;
use magnav::service::NavService;
use magnav::sim::random_walk_positions;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "magnav",
    version,
    about = "Magnetic anomaly navigation demo CLI"
)]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Command,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone, Debug)]
enum Command {
    #[command(about = "Generate a jittered trajectory as JSON")]
    Simulate(SimulateArgs),
    #[command(about = "Fuse a single position observation and print the updated state")]
    Estimate(EstimateArgs),
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Number of points to emit
    #[arg(long, default_value_t = 10)]
    steps: usize,
    /// Output file path (stdout when omitted)
    #[arg(long)]
    output: Option<PathBuf>,
    /// RNG seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Args, Clone, Debug)]
struct EstimateArgs {
    /// Latitude of the observation in degrees
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    /// Longitude of the observation in degrees
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// Start from the initial filter state before fusing
    #[arg(long)]
    reset: bool,
}

/// Initialize the logger with the specified configuration
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'warn'", log_level);
        log::LevelFilter::Warn
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let positions = random_walk_positions(args.steps, args.seed);
    let records: Vec<_> = positions
        .iter()
        .map(|p| json!({ "lat": p.lat(), "lon": p.lon() }))
        .collect();
    match &args.output {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&records)?)?;
            info!("wrote {} positions to {}", records.len(), path.display());
        }
        None => println!("{}", serde_json::to_string(&records)?),
    }
    Ok(())
}

fn run_estimate(args: &EstimateArgs) -> anyhow::Result<()> {
    let observation = LatLon::new(args.lat, args.lon)?;
    let service = NavService::without_map();
    if args.reset {
        service.reset(LatLon::new(0.0, 0.0).expect("origin is a valid position"));
    }
    // One full cycle at the default one-second cadence
    let estimate = service.observe_position(observation, 1.0)?;
    let output = json!({
        "lat": estimate.lat,
        "lon": estimate.lon,
        "quality": estimate.quality,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())
        .map_err(|e| anyhow::anyhow!("logger init failed: {e}"))?;

    match &cli.command {
        Command::Simulate(args) => run_simulate(args),
        Command::Estimate(args) => run_estimate(args),
    }
}
