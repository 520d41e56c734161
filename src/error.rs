//! Diagnostic error types for the launcher.
//!
//! Only genuine failures live here. Outcomes such as a contended lock, an
//! already-running service or a readiness timeout are ordinary results and
//! are modelled by [`crate::supervisor::LaunchOutcome`] instead.

// False positive: fields are used in #[error] format strings and miette derive macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors related to the single-instance lock and its on-disk artifacts.
#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error("failed to create lock file: {}", path.display())]
    #[diagnostic(
        code(tether::lock::create_failed),
        help("check that the state directory exists and is writable, or set TETHER_STATE_DIR")
    )]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write lock record: {}", path.display())]
    #[diagnostic(code(tether::lock::write_failed))]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove stale file: {}", path.display())]
    #[diagnostic(
        code(tether::lock::cleanup_failed),
        help("remove the file by hand once you are sure no tether supervisor is running")
    )]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize stale lock reclaim for {}", path.display())]
    #[diagnostic(code(tether::lock::reclaim_failed))]
    Reclaim {
        path: PathBuf,
        #[source]
        source: xx::XXError,
    },

    #[error("failed to check whether process {pid} is alive")]
    #[diagnostic(code(tether::lock::probe_failed))]
    Probe {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while starting the service process.
#[derive(Debug, Error, Diagnostic)]
pub enum LaunchError {
    #[error("no command given to launch")]
    #[diagnostic(
        code(tether::launch::empty_command),
        help("pass the service command after `--`, e.g. `tether start -- npm run dev`")
    )]
    EmptyCommand,

    #[error("invalid environment override '{raw}'")]
    #[diagnostic(
        code(tether::launch::invalid_env),
        help("environment overrides must look like KEY=VALUE")
    )]
    InvalidEnv { raw: String },

    #[error("failed to spawn `{command}`")]
    #[diagnostic(
        code(tether::launch::spawn_failed),
        help("make sure the program exists and is on PATH")
    )]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("service `{command}` exited before its pid could be captured")]
    #[diagnostic(code(tether::launch::no_pid))]
    NoPid { command: String },

    #[error("failed to write pid file: {}", path.display())]
    #[diagnostic(code(tether::launch::pid_write_failed))]
    PidWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers")]
    #[diagnostic(code(tether::launch::signal_setup))]
    Signals {
        #[source]
        source: io::Error,
    },

    #[error("failed to start async runtime")]
    #[diagnostic(code(tether::launch::runtime))]
    Runtime {
        #[source]
        source: io::Error,
    },
}

/// Errors raised while detaching the supervisor into the background.
#[derive(Debug, Error, Diagnostic)]
pub enum DaemonizeError {
    #[error("fork failed")]
    #[diagnostic(code(tether::daemon::fork_failed))]
    Fork {
        #[source]
        source: io::Error,
    },

    #[error("failed to create a new session")]
    #[diagnostic(code(tether::daemon::setsid_failed))]
    Setsid {
        #[source]
        source: io::Error,
    },

    #[error("failed to redirect standard streams to {}", path.display())]
    #[diagnostic(code(tether::daemon::redirect_failed))]
    Redirect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background mode is only supported on unix")]
    #[diagnostic(
        code(tether::daemon::unsupported),
        help("run without --daemon to supervise in the foreground")
    )]
    Unsupported,
}
