//! hosterd — the Hoster control plane daemon.
//!
//! Single binary assembling every subsystem: the SQLite store, the
//! container runtimes, the SSH node pool, the background workers, and
//! the two HTTP listeners (JSON API + hostname router).
//!
//! # Usage
//!
//! ```text
//! hosterd --config /etc/hoster/config.toml
//! HOSTER_SERVER_PORT=3000 hosterd
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 database error,
//! 3 HTTP server error.

mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use hoster_core::Config;

use crate::server::RunError;

#[derive(Parser)]
#[command(name = "hosterd", version, about = "Hoster control plane daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hosterd=debug,hoster=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(server::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            match e {
                RunError::Init(_) => ExitCode::from(1),
                RunError::Database(_) => ExitCode::from(2),
                RunError::Http(_) => ExitCode::from(3),
            }
        }
    }
}
