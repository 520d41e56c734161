//! The supervised child process.

use crate::env;
use crate::error::LaunchError;
use crate::readiness::ExitWatch;
use crate::state_file::StateFiles;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

/// Exit code reported when the child's status could not be collected
const UNKNOWN_EXIT: i32 = 1;

/// How to start the service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub command: Vec<String>,
    /// Overlaid on top of the inherited environment
    pub env: Vec<(String, String)>,
    pub dir: Option<PathBuf>,
    /// Bind stdin to an empty source, used when running detached
    pub null_stdin: bool,
}

impl ServiceSpec {
    pub fn display(&self) -> String {
        shell_words::join(&self.command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIs)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    Running,
    Exited(i32),
}

/// Handle to a running service. Only valid while `state` is `Running`.
#[derive(Debug)]
pub struct ServiceProcess {
    pub pid: u32,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub started_at: DateTime<Local>,
    pub state: ServiceState,
    child: tokio::process::Child,
}

impl ServiceProcess {
    /// Starts the service and records its pid before returning, so anyone
    /// inspecting the pid file always finds the current child.
    pub fn spawn(spec: &ServiceSpec, files: &StateFiles) -> Result<Self, LaunchError> {
        let display = spec.display();
        let (program, args) = spec
            .command
            .split_first()
            .ok_or(LaunchError::EmptyCommand)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if spec.null_stdin {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        // Ensure the service can find user tools by using the original PATH
        if let Some(ref path) = *env::ORIGINAL_PATH {
            cmd.env("PATH", path);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        super::signals::restore_defaults_in_child(&mut cmd);

        info!("spawning service: {display}");
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: display.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(LaunchError::NoPid { command: display });
        };
        if let Err(source) = files.write_pid(pid) {
            // an untracked child would be invisible to every later launch
            let _ = child.start_kill();
            return Err(LaunchError::PidWrite {
                path: files.pid_path().to_path_buf(),
                source,
            });
        }
        info!("started service with pid {pid}");
        Ok(Self {
            pid,
            command: display,
            env: spec.env.clone(),
            started_at: Local::now(),
            state: ServiceState::Running,
            child,
        })
    }

    /// Blocks until the child exits and returns its exit code. A child killed
    /// by a signal reports 128 + the signal number.
    pub async fn wait(&mut self) -> i32 {
        if let ServiceState::Exited(code) = self.state {
            return code;
        }
        let code = match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!("failed to wait for service pid {}: {e}", self.pid);
                UNKNOWN_EXIT
            }
        };
        debug!(
            "service pid {} exited with code {code} after {}",
            self.pid,
            humantime::format_duration(uptime(self.started_at))
        );
        self.state = ServiceState::Exited(code);
        code
    }

    /// Sends signal number `signo` to the child if it is still running
    pub fn forward(&mut self, signo: i32) {
        if !self.state.is_running() {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let (Ok(raw), Ok(signal)) = (i32::try_from(self.pid), Signal::try_from(signo)) else {
                return;
            };
            if let Err(e) = kill(Pid::from_raw(raw), signal) {
                debug!("could not send {signal} to pid {}: {e}", self.pid);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signo;
            let _ = self.child.start_kill();
        }
    }

    /// Terminates the child: a polite request first, then a kill once
    /// `grace` has passed.
    pub async fn stop(&mut self, grace: Duration) -> i32 {
        #[cfg(unix)]
        self.forward(libc::SIGTERM);
        #[cfg(not(unix))]
        self.forward(15);
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(code) => code,
            Err(_) => self.kill().await,
        }
    }

    pub async fn kill(&mut self) -> i32 {
        if self.state.is_running() {
            warn!("killing service pid {}", self.pid);
            if let Err(e) = self.child.start_kill() {
                debug!("kill of pid {} failed: {e}", self.pid);
            }
        }
        self.wait().await
    }
}

impl ExitWatch for ServiceProcess {
    async fn exited(&mut self) -> i32 {
        self.wait().await
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT
}

fn uptime(started_at: DateTime<Local>) -> Duration {
    (Local::now() - started_at).to_std().unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(script: &str) -> ServiceSpec {
        ServiceSpec {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: vec![("NODE_ENV".to_string(), "development".to_string())],
            dir: None,
            null_stdin: true,
        }
    }

    #[tokio::test]
    async fn test_spawn_writes_pid_and_propagates_exit_code() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let mut service = ServiceProcess::spawn(&spec("exit 17"), &files).unwrap();
        assert_eq!(files.read_pid(), Some(service.pid));
        assert!(service.state.is_running());

        assert_eq!(service.wait().await, 17);
        assert_eq!(service.state, ServiceState::Exited(17));
        // a second wait returns the cached code
        assert_eq!(service.wait().await, 17);
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let mut service = ServiceProcess::spawn(
            &spec(r#"[ "$NODE_ENV" = development ] && exit 0 || exit 3"#),
            &files,
        )
        .unwrap();
        assert_eq!(service.wait().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let spec = ServiceSpec {
            command: vec!["/definitely/not/a/program".to_string()],
            env: vec![],
            dir: None,
            null_stdin: true,
        };
        let err = ServiceProcess::spawn(&spec, &files).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(files.read_pid(), None);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let spec = ServiceSpec {
            command: vec![],
            env: vec![],
            dir: None,
            null_stdin: true,
        };
        let err = ServiceProcess::spawn(&spec, &files).unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_stop_reports_signal_exit() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let mut service = ServiceProcess::spawn(&spec("exec sleep 30"), &files).unwrap();
        let code = service.stop(Duration::from_secs(5)).await;
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        let mut service = ServiceProcess::spawn(
            &spec("trap '' TERM; while true; do sleep 1; done"),
            &files,
        )
        .unwrap();
        // give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let code = service.stop(Duration::from_millis(300)).await;
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[test]
    fn test_display_quotes_arguments() {
        assert_eq!(spec("exit 1").display(), "sh -c 'exit 1'");
    }
}
