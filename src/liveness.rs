//! Process liveness checks.
//!
//! The lock manager never asks the OS directly whether a pid is alive; it goes
//! through a [`LivenessOracle`] so tests can describe the process table they
//! want without spawning anything.

use std::io;

/// Answers "is there a live process with this pid?".
pub trait LivenessOracle {
    fn is_alive(&self, pid: u32) -> io::Result<bool>;
}

/// Probes with signal 0, which performs permission and existence checks
/// without delivering anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalZero;

#[cfg(unix)]
impl LivenessOracle for SignalZero {
    fn is_alive(&self, pid: u32) -> io::Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return Ok(false);
        };
        if raw <= 0 {
            return Ok(false);
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => Ok(true),
            // exists, but owned by someone else
            Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[cfg(not(unix))]
impl LivenessOracle for SignalZero {
    fn is_alive(&self, pid: u32) -> io::Result<bool> {
        crate::procs::PROCS.refresh_pids(&[pid]);
        Ok(crate::procs::PROCS.is_running(pid))
    }
}

impl<T: LivenessOracle + ?Sized> LivenessOracle for &T {
    fn is_alive(&self, pid: u32) -> io::Result<bool> {
        (**self).is_alive(pid)
    }
}
