mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tf_daemon::orchestrator::OrchestratorError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// taskforge CLI -- load task graphs and drive them through worker agents.
#[derive(Parser, Debug)]
#[command(name = "tf", version, about)]
struct Cli {
    /// Config file (default: ~/.taskforge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Task store database, overriding `store.path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Validate a task list (JSON or TOML) and persist it.
    Load {
        file: PathBuf,
    },

    /// Print the next wave without executing anything.
    Plan,

    /// Run the orchestrator until every task settles (ctrl-c stops gracefully).
    Run,

    /// Show task counts per status.
    Status,

    /// Print a task's full history as JSON.
    History {
        /// Display id or uuid.
        task: String,
    },

    /// Skip a task that is not running.
    Cancel {
        /// Display id or uuid.
        task: String,
    },

    /// Move an escalated (blocked) task back to pending.
    Resume {
        /// Display id or uuid.
        task: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match commands::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<OrchestratorError>() {
                Some(OrchestratorError::SchedulingStall(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
