//! safeedged — the SafeEdge fleet control plane daemon.
//!
//! Single binary that assembles the control plane:
//! - Fleet repository (redb)
//! - Connectivity registry + liveness tracker
//! - Artifact trust verifier
//! - Rollout engine + reconciler
//! - REST API + device streams
//!
//! # Usage
//!
//! ```text
//! safeedged run --config /etc/safeedge/safeedged.toml --port 8080
//! ```

mod config;
mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "info,safeedged=debug,safeedge=debug";

#[derive(Parser)]
#[command(name = "safeedged", about = "SafeEdge fleet control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.http_port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);

            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.http_port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            control_plane::run_control_plane(config).await
        }
    }
}
