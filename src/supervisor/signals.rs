//! Signal handling across the launch.
//!
//! From lock acquisition until the service is spawned, hangup, interrupt and
//! termination are ignored so the lock is never abandoned mid-launch. Once the service runs, termination requests are caught and routed
//! into the normal cleanup path.

use crate::error::LaunchError;

/// Ignores SIGHUP, SIGINT and SIGTERM until the service is spawned
#[cfg(unix)]
pub fn shield() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: SigIgn installs no Rust handler code
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!("could not ignore {sig}: {e}");
        }
    }
    debug!("ignoring SIGHUP, SIGINT and SIGTERM until the service is spawned");
}

#[cfg(not(unix))]
pub fn shield() {}

/// Ignored dispositions survive exec, so the service would inherit them.
/// Put the defaults back in the child before it execs.
#[cfg(unix)]
pub(crate) fn restore_defaults_in_child(cmd: &mut tokio::process::Command) {
    // SAFETY: signal(2) is async-signal-safe and the closure allocates nothing
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGHUP, libc::SIG_DFL);
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            Ok(())
        });
    }
}

/// Listens for termination requests once the service has been spawned.
pub struct Propagation {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Propagation {
    #[cfg(unix)]
    pub fn install() -> Result<Self, LaunchError> {
        use tokio::signal::unix::{SignalKind, signal};

        let listen = |kind| signal(kind).map_err(|source| LaunchError::Signals { source });
        Ok(Self {
            terminate: listen(SignalKind::terminate())?,
            interrupt: listen(SignalKind::interrupt())?,
            hangup: listen(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self, LaunchError> {
        Ok(Self {})
    }

    /// Resolves with the number of the next termination signal received
    #[cfg(unix)]
    pub async fn recv(&mut self) -> i32 {
        let signo = tokio::select! {
            _ = self.terminate.recv() => libc::SIGTERM,
            _ = self.interrupt.recv() => libc::SIGINT,
            _ = self.hangup.recv() => libc::SIGHUP,
        };
        info!("received signal {signo}");
        signo
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> i32 {
        let _ = tokio::signal::ctrl_c().await;
        2
    }
}
