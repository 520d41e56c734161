use crate::Result;
use crate::cli::StateArgs;
use crate::liveness::{LivenessOracle, SignalZero};
use crate::procs::PROCS;
use crate::state_file::LockFileState;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Asks the running supervisor to shut down
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "kill",
    verbatim_doc_comment,
    long_about = "\
Asks the running supervisor to shut down

Sends SIGTERM to the supervisor recorded in the lock file. The supervisor
forwards it to the service and removes its lock and pid files once the
service is gone. Exits 1 if that does not happen within --timeout.

Examples:
  tether stop                  Stop and wait up to 15s
  tether stop --timeout 1m     Give the service longer to shut down"
)]
pub struct Stop {
    /// How long to wait for the supervisor to clean up
    #[clap(long, default_value = "15s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    #[clap(flatten)]
    state: StateArgs,
}

impl Stop {
    pub fn run(self) -> Result<i32> {
        super::block_on(self.execute())?
    }

    async fn execute(&self) -> Result<i32> {
        let files = self.state.files();
        let pid = match files.read_lock() {
            LockFileState::Owned(record) => record.pid,
            LockFileState::Missing => {
                info!("no supervisor is running");
                return Ok(0);
            }
            LockFileState::Unreadable { .. } => {
                warn!(
                    "lock file {} holds no pid; nothing to stop",
                    files.lock_path().display()
                );
                return Ok(0);
            }
        };
        if !SignalZero.is_alive(pid).unwrap_or(true) {
            warn!("supervisor {pid} is not running; its lock will be reclaimed by the next start");
            return Ok(0);
        }
        if !PROCS.terminate(pid) {
            warn!("could not signal supervisor {pid}");
            return Ok(1);
        }

        let deadline = Instant::now() + self.timeout;
        while files.lock_path().exists() {
            if Instant::now() >= deadline {
                error!(
                    "supervisor {pid} still running after {}",
                    humantime::format_duration(self.timeout)
                );
                return Ok(1);
            }
            sleep(Duration::from_millis(100)).await;
        }
        info!("stopped supervisor {pid}");
        Ok(0)
    }
}
