//! MAGNAV-SERVER: HTTP and tool-call transport for the magnetic anomaly
//! navigation service.
//!
//! The server loads the anomaly map named by `QMAG_NAV_MAP_PATH` at
//! startup. When the variable is absent the server still comes up, but
//! every map-dependent endpoint answers 503 until it is restarted with a
//! map; that keeps health probes and deployment smoke tests meaningful on
//! hosts without map data.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;

use magnav::map::open_map;
use magnav::service::NavService;
use magnav_server::{create_router, AppState, MAP_PATH_ENV};

/// Command line arguments
#[derive(Parser)]
#[command(
    name = "magnav-server",
    version,
    about = "HTTP and tool-call surface for magnetic anomaly navigation"
)]
struct Cli {
    /// Host address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Initialize the logger with the specified configuration
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
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

/// Build the navigation service from the environment.
fn build_service() -> NavService {
    match std::env::var(MAP_PATH_ENV) {
        Ok(path) if !path.is_empty() => match open_map(&path) {
            Ok(map) => match NavService::with_map(Arc::new(map)) {
                Ok(service) => {
                    info!("serving map from {path}");
                    service
                }
                Err(e) => {
                    warn!("service construction failed ({e}); map endpoints disabled");
                    NavService::without_map()
                }
            },
            Err(e) => {
                warn!("failed to load map from {path}: {e}; map endpoints disabled");
                NavService::without_map()
            }
        },
        _ => {
            warn!("{MAP_PATH_ENV} not set; map endpoints disabled");
            NavService::without_map()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())
        .map_err(|e| anyhow::anyhow!("logger init failed: {e}"))?;

    let state = Arc::new(AppState {
        service: build_service(),
    });
    let app = create_router(state);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
        info!("listening on http://{addr}");
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    })
}
