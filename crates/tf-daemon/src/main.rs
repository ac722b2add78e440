//! taskforge daemon: runs the orchestrator over the configured task store
//! until every task settles or ctrl-c is pressed.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tf_core::config::Config;
use tf_daemon::daemon::{self, Daemon};
use tf_daemon::orchestrator::OrchestratorError;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "daemon execution failed");
            eprintln!("error: {e:#}");
            match e.downcast_ref::<OrchestratorError>() {
                Some(OrchestratorError::SchedulingStall(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run() -> Result<()> {
    let config = match std::env::var_os("TASKFORGE_CONFIG") {
        Some(path) => Config::load_from(path).context("failed to load config")?,
        None => Config::load().context("failed to load config")?,
    };
    daemon::init_logging(&config, "tf-daemon");
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "taskforge daemon starting");

    let daemon = Daemon::new(config).await?;
    daemon.install_ctrl_c();
    let status = daemon.run().await?;
    info!(counts = ?status.counts, "taskforge daemon stopped");
    Ok(())
}
