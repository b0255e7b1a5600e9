//! `sentrad` entry point.

#![deny(unsafe_code)]

use clap::Parser;
use service::{Daemon, ServiceConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sentrad", about = "System-wide access-control decision daemon")]
struct Cli {
    /// YAML configuration file; compiled-in defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the policy database directory.
    #[arg(long)]
    db_dir: Option<PathBuf>,
    /// Override the client/agent socket path.
    #[arg(long)]
    client_socket: Option<PathBuf>,
    /// Override the admin socket path.
    #[arg(long)]
    admin_socket: Option<PathBuf>,
    /// Record a monitor entry per check.
    #[arg(long, default_value_t = false)]
    monitoring: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    service::logging::init();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(path) => match ServiceConfig::load_from_yaml_path(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                return std::process::ExitCode::FAILURE;
            }
        },
        None => ServiceConfig::default(),
    };
    if let Some(dir) = cli.db_dir {
        config.database_dir = dir;
    }
    if let Some(path) = cli.client_socket {
        config.client_socket = path;
    }
    if let Some(path) = cli.admin_socket {
        config.admin_socket = path;
    }
    if cli.monitoring {
        config.monitoring = true;
    }

    let daemon = Daemon::new(config);
    tokio::select! {
        result = daemon.run() => match result {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "daemon failed");
                std::process::ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            std::process::ExitCode::SUCCESS
        }
    }
}
