//! Detaching the supervisor from its terminal.
//!
//! Must run before any threads exist (in particular before the tokio runtime
//! is built): only the forking thread survives in the child.

use crate::error::DaemonizeError;
use std::path::PathBuf;

/// Which side of the fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// The original process; `child` is the detached supervisor
    Parent { child: DetachedSupervisor },
    /// The detached supervisor itself
    Child,
}

/// Handle the launching process keeps on the background supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachedSupervisor {
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct Daemonizer {
    /// stdout/stderr of the detached supervisor (and its service) go here
    pub output: PathBuf,
}

impl Daemonizer {
    pub fn new(output: PathBuf) -> Self {
        Self { output }
    }

    /// Forks. The child starts a new session, takes `/dev/null` as stdin and
    /// appends its output to [`Daemonizer::output`].
    #[cfg(unix)]
    pub fn detach(&self) -> Result<Detach, DaemonizeError> {
        use nix::unistd::{ForkResult, fork, setsid};

        if let Some(parent) = self.output.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DaemonizeError::Redirect {
                path: self.output.clone(),
                source,
            })?;
        }
        // SAFETY: callers run this before spawning any threads
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw() as u32;
                debug!("forked detached supervisor {pid}");
                Ok(Detach::Parent {
                    child: DetachedSupervisor { pid },
                })
            }
            Ok(ForkResult::Child) => {
                setsid().map_err(|e| DaemonizeError::Setsid { source: e.into() })?;
                self.redirect_stdio()?;
                info!("detached into the background as pid {}", std::process::id());
                Ok(Detach::Child)
            }
            Err(e) => Err(DaemonizeError::Fork { source: e.into() }),
        }
    }

    #[cfg(not(unix))]
    pub fn detach(&self) -> Result<Detach, DaemonizeError> {
        Err(DaemonizeError::Unsupported)
    }

    #[cfg(unix)]
    fn redirect_stdio(&self) -> Result<(), DaemonizeError> {
        use nix::unistd::{dup2_stderr, dup2_stdin, dup2_stdout};
        use std::fs::{File, OpenOptions};

        let devnull = File::open("/dev/null").map_err(redirect_err("/dev/null"))?;
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output)
            .map_err(redirect_err(&self.output))?;
        dup2_stdin(&devnull).map_err(|e| redirect_err("/dev/null")(e.into()))?;
        dup2_stdout(&output).map_err(|e| redirect_err(&self.output)(e.into()))?;
        dup2_stderr(&output).map_err(|e| redirect_err(&self.output)(e.into()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn redirect_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> DaemonizeError {
    let path = path.into();
    move |source| DaemonizeError::Redirect { path, source }
}

/// Parent-side wait: returns once the port opens, the detached supervisor
/// exits, or `budget` runs out.
#[cfg(unix)]
pub async fn await_detached(
    child: DetachedSupervisor,
    host: &str,
    port: u16,
    interval: std::time::Duration,
    budget: std::time::Duration,
) -> DetachedStatus {
    use crate::port::is_port_open;
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;
    use tokio::time::{Instant, sleep};

    let deadline = Instant::now() + budget;
    let pid = Pid::from_raw(child.pid as i32);
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => return DetachedStatus::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return DetachedStatus::Exited(128 + signal as i32);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("waitpid on {} failed: {e}", child.pid);
                return DetachedStatus::Exited(1);
            }
        }
        if is_port_open(host, port, interval).await {
            return DetachedStatus::Listening;
        }
        if Instant::now() >= deadline {
            return DetachedStatus::Pending;
        }
        sleep(interval).await;
    }
}

/// What the launching process saw of its detached supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachedStatus {
    Listening,
    /// Exited (code) before the port opened
    Exited(i32),
    /// Still running, port not open yet
    Pending,
}

impl DetachedStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            DetachedStatus::Listening | DetachedStatus::Pending => 0,
            // contended and already-running launches exit 0 too
            DetachedStatus::Exited(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_status_exit_codes() {
        assert_eq!(DetachedStatus::Listening.exit_code(), 0);
        assert_eq!(DetachedStatus::Pending.exit_code(), 0);
        assert_eq!(DetachedStatus::Exited(1).exit_code(), 1);
        assert_eq!(DetachedStatus::Exited(0).exit_code(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_await_detached_sees_exit() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .spawn()
            .unwrap();
        let handle = DetachedSupervisor { pid: child.id() };
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let status = await_detached(
            handle,
            "127.0.0.1",
            port,
            std::time::Duration::from_millis(50),
            std::time::Duration::from_secs(5),
        )
        .await;
        assert_eq!(status, DetachedStatus::Exited(4));
    }
}
