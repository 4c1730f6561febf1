//! `record-sync`: run updates, serve the batch worker, or poke the chain by hand.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use uuid::Uuid;

use record_sync::batch::{BatchExecutor, TaskOrchestrator};
use record_sync::config::{load_config, parse_config, SyncConfig};
use record_sync::lifecycle::{wait_for_signal, Shutdown};
use record_sync::observability::{init_logging, metrics};
use record_sync::store::SyncMode;
use record_sync::{RunOptions, SyncContext, UpdateCoordinator, WorkerServer};

#[derive(Parser)]
#[command(name = "record-sync", version, about = "Incremental record synchronization engine")]
struct Cli {
    /// TOML configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = "record-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Incremental,
    Full,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Incremental => SyncMode::Incremental,
            ModeArg::Full => SyncMode::Full,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one update
    Run {
        #[arg(long, value_enum, default_value = "incremental")]
        mode: ModeArg,
        /// Plan only, mutate nothing
        #[arg(long)]
        dry_run: bool,
        /// Skip the minimum-interval check
        #[arg(long)]
        force: bool,
    },
    /// Serve the batch endpoint with the sweep and queue loops
    Worker,
    /// Run a single liveness sweep
    Sweep,
    /// Execute one batch in this process
    Execute { batch_id: Uuid },
}

fn read_config(path: &Path) -> Result<SyncConfig, record_sync::config::ConfigError> {
    if path.exists() {
        load_config(path)
    } else {
        parse_config("")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = read_config(&cli.config)?;
    init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "record-sync starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let bind_address = config.worker.bind_address.clone();
    let ctx = SyncContext::from_config(config)?;

    match cli.command {
        Commands::Run { mode, dry_run, force } => {
            let options = RunOptions {
                mode: mode.into(),
                dry_run,
                force,
            };
            let outcome = UpdateCoordinator::new(ctx).run(options).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Worker => {
            let listener = TcpListener::bind(&bind_address).await?;
            let shutdown = Shutdown::new();
            let server = WorkerServer::new(ctx);

            let serving = server.run(listener, &shutdown);
            tokio::pin!(serving);
            tokio::select! {
                result = &mut serving => result?,
                _ = wait_for_signal() => {
                    shutdown.trigger();
                    serving.await?;
                }
            }
        }
        Commands::Sweep => {
            let report = TaskOrchestrator::new(ctx).sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Execute { batch_id } => {
            let report = BatchExecutor::new(ctx).execute(batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
