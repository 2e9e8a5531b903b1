//! stratad — the Strata daemon binary.
//!
//! # Usage
//!
//! ```text
//! stratad --config /etc/strata/stratad.toml standalone --data-dir /var/lib/strata
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_runner::ProcessDriver;
use stratad::{open_store, Daemon, DaemonConfig, LogFormat};

#[derive(Parser)]
#[command(name = "stratad", about = "Strata daemon")]
struct Cli {
    /// TOML config file. Every setting has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the whole control plane and a runner in one process.
    Standalone {
        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// REST API port.
        #[arg(long)]
        api_port: Option<u16>,

        /// Ingress port.
        #[arg(long)]
        ingress_port: Option<u16>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

/// Longest graceful shutdown before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

fn init_tracing(config: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    match cli.command {
        Command::Standalone {
            data_dir,
            in_memory,
            api_port,
            ingress_port,
        } => {
            if let Some(dir) = data_dir {
                config.store.data_dir = dir;
            }
            config.store.in_memory |= in_memory;
            if let Some(port) = api_port {
                config.api.port = port;
            }
            if let Some(port) = ingress_port {
                config.ingress.port = port;
            }
            init_tracing(&config);
            run_standalone(config).await
        }
        Command::PrintConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(config: DaemonConfig) -> anyhow::Result<()> {
    info!("strata daemon starting in standalone mode");

    let store = open_store(&config)?;
    let driver = Arc::new(ProcessDriver::new(config.runner.address.clone()));
    let daemon = Daemon::start(&config, store, driver).await?;
    info!(
        api = %daemon.api_addr(),
        ingress = %daemon.ingress_addr(),
        node = %daemon.node(),
        "strata daemon running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    if tokio::time::timeout(SHUTDOWN_GRACE, daemon.shutdown()).await.is_err() {
        warn!(grace = ?SHUTDOWN_GRACE, "shutdown did not finish in time, exiting");
    }
    Ok(())
}
