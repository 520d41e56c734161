use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate};
#[cfg(unix)]
use sysinfo::Signal;

pub struct Procs {
    system: Mutex<sysinfo::System>,
}

pub static PROCS: Lazy<Procs> = Lazy::new(Procs::new);

impl Default for Procs {
    fn default() -> Self {
        Self::new()
    }
}

impl Procs {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    fn lock_system(&self) -> std::sync::MutexGuard<'_, sysinfo::System> {
        self.system.lock().unwrap_or_else(|poisoned| {
            warn!("System mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn title(&self, pid: u32) -> Option<String> {
        self.lock_system()
            .process(Pid::from_u32(pid))
            .map(|p| p.name().to_string_lossy().to_string())
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.lock_system().process(Pid::from_u32(pid)).is_some()
    }

    /// Refreshes only the given pids, dropping the ones that no longer exist
    pub fn refresh_pids(&self, pids: &[u32]) {
        let pids = pids.iter().map(|p| Pid::from_u32(*p)).collect::<Vec<_>>();
        self.lock_system().refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing(),
        );
    }

    /// Sends a polite termination request. Returns false if the process was
    /// not found or the signal could not be delivered.
    pub fn terminate(&self, pid: u32) -> bool {
        self.refresh_pids(&[pid]);
        match self.lock_system().process(Pid::from_u32(pid)) {
            Some(process) => {
                debug!("sending termination to pid {pid}");
                #[cfg(unix)]
                {
                    process.kill_with(Signal::Term).unwrap_or(false)
                }
                #[cfg(windows)]
                {
                    process.kill()
                }
            }
            None => false,
        }
    }

    /// Polls until every pid is gone or `grace` elapses. Returns the pids
    /// that are still running.
    pub async fn wait_for_exit(&self, pids: &[u32], grace: Duration) -> Vec<u32> {
        let deadline = Instant::now() + grace;
        loop {
            self.refresh_pids(pids);
            let remaining = pids
                .iter()
                .copied()
                .filter(|pid| self.is_running(*pid))
                .collect::<Vec<_>>();
            if remaining.is_empty() || Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
