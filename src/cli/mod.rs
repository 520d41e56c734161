use crate::error::LaunchError;
use crate::state_file::StateFiles;
use crate::{Result, env};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;

mod start;
mod status;
mod stop;

#[derive(Debug, clap::Parser)]
#[clap(name = "tether", version, about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Start(start::Start),
    Status(status::Status),
    Stop(stop::Stop),
}

/// Where the lock and pid artifacts live
#[derive(Debug, Clone, clap::Args)]
pub struct StateArgs {
    /// Lock file recording the supervisor pid
    #[clap(long, env = "TETHER_LOCK_FILE", value_name = "PATH")]
    lock_file: Option<PathBuf>,
    /// Pid file recording the service pid
    #[clap(long, env = "TETHER_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,
}

impl StateArgs {
    pub fn files(&self) -> StateFiles {
        StateFiles::new(
            self.lock_file
                .clone()
                .unwrap_or_else(|| env::TETHER_LOCK_FILE.clone()),
            self.pid_file
                .clone()
                .unwrap_or_else(|| env::TETHER_PID_FILE.clone()),
        )
    }
}

/// Parses the command line and runs it, returning the process exit code
pub fn run() -> Result<i32> {
    let args = Cli::parse();
    match args.command {
        Commands::Start(start) => start.run(),
        Commands::Status(status) => status.run(),
        Commands::Stop(stop) => stop.run(),
    }
}

/// Runs a short-lived subcommand on a single-threaded runtime. `start` builds
/// its own runtime since it may fork first.
fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| LaunchError::Runtime { source })?;
    Ok(runtime.block_on(fut))
}
