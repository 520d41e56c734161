use crate::Result;
use crate::cli::StateArgs;
use crate::liveness::{LivenessOracle, SignalZero};
use crate::port::is_port_open;
use crate::readiness::{DEFAULT_PORT, PROBE_TIMEOUT};
use crate::state_file::{LockFileState, LockRecord};
use miette::IntoDiagnostic;
use serde::Serialize;

/// Display the state of the supervisor and its service
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "stat",
    verbatim_doc_comment,
    long_about = "\
Display the state of the supervisor and its service

Reads the lock and pid files and checks whether the recorded processes are
alive and whether anything answers on the service port.

Example:
  tether status

Output:
  Supervisor: 12345 (running)
  Service: 12350 (running)
  Port 5000: open"
)]
pub struct Status {
    /// Port the service listens on
    #[clap(short, long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Host used for the port probe
    #[clap(long, env = "TETHER_HOST", default_value = "127.0.0.1")]
    host: String,
    /// Print the report as JSON
    #[clap(long)]
    json: bool,
    #[clap(flatten)]
    pub(super) state: StateArgs,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    lock: Option<LockRecord>,
    supervisor_alive: bool,
    service_pid: Option<u32>,
    service_alive: bool,
    port: u16,
    port_open: bool,
}

impl Status {
    pub fn run(self) -> Result<i32> {
        super::block_on(self.execute())?
    }

    async fn execute(&self) -> Result<i32> {
        let report = self.report().await;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).into_diagnostic()?
            );
            return Ok(0);
        }
        match &report.lock {
            Some(lock) => println!(
                "Supervisor: {} ({})",
                lock.pid,
                liveness_label(report.supervisor_alive)
            ),
            None => println!("Supervisor: -"),
        }
        match report.service_pid {
            Some(pid) => println!(
                "Service: {pid} ({})",
                liveness_label(report.service_alive)
            ),
            None => println!("Service: -"),
        }
        println!(
            "Port {}: {}",
            report.port,
            if report.port_open {
                console::style("open").green()
            } else {
                console::style("closed").dim()
            }
        );
        Ok(0)
    }

    async fn report(&self) -> StatusReport {
        let files = self.state.files();
        let alive = |pid: u32| SignalZero.is_alive(pid).unwrap_or(false);
        let lock = match files.read_lock() {
            LockFileState::Owned(record) => Some(record),
            LockFileState::Missing => None,
            LockFileState::Unreadable { .. } => {
                warn!(
                    "lock file {} has no readable pid",
                    files.lock_path().display()
                );
                None
            }
        };
        let service_pid = files.read_pid();
        StatusReport {
            supervisor_alive: lock.as_ref().is_some_and(|l| alive(l.pid)),
            service_alive: service_pid.is_some_and(alive),
            lock,
            service_pid,
            port: self.port,
            port_open: is_port_open(&self.host, self.port, PROBE_TIMEOUT).await,
        }
    }
}

fn liveness_label(alive: bool) -> console::StyledObject<&'static str> {
    if alive {
        console::style("running").green()
    } else {
        console::style("stale").yellow()
    }
}
