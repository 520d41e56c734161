//! Detects whatever already listens on the service port and, when asked,
//! terminates it so a fresh instance can bind.

use crate::procs::PROCS;
use std::time::Duration;
use tokio::net::TcpStream;

/// How long a reclaimed listener gets to exit before we move on regardless
pub const RECLAIM_GRACE: Duration = Duration::from_secs(3);

/// Bounded-timeout TCP connect probe. A successful connect means something is
/// serving on the port.
pub async fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("port {port} connect failed: {e}");
            false
        }
        Err(_) => {
            trace!("port {port} connect timed out after {timeout:?}");
            false
        }
    }
}

/// What [`PortReclaimer::reclaim`] managed to do. Never an error: a port we
/// could not free surfaces later as a bind failure in the service itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    /// Nobody we can identify is listening
    Free,
    /// All listeners exited after being signalled
    Reclaimed { pids: Vec<u32> },
    /// Some listeners are still around, or could not be identified
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct PortReclaimer {
    grace: Duration,
}

impl Default for PortReclaimer {
    fn default() -> Self {
        Self::new(RECLAIM_GRACE)
    }
}

impl PortReclaimer {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Pids of processes listening on `port`, excluding ourselves
    pub fn owners(&self, port: u16) -> Result<Vec<u32>, String> {
        let me = std::process::id();
        let all = listeners::get_all()
            .map_err(|e| format!("could not list listeners on port {port}: {e}"))?;
        let mut pids = owners_of(all, port, me);
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Signals termination to every listener on `port` and waits up to the
    /// grace period for them to exit.
    pub async fn reclaim(&self, port: u16) -> Reclaim {
        let pids = match self.owners(port) {
            Ok(pids) => pids,
            Err(reason) => {
                warn!("{reason}");
                return Reclaim::Failed { reason };
            }
        };
        if pids.is_empty() {
            debug!("no identifiable listener on port {port}");
            return Reclaim::Free;
        }
        PROCS.refresh_pids(&pids);
        for pid in &pids {
            let title = PROCS.title(*pid).unwrap_or_else(|| "?".to_string());
            info!("terminating {title} (pid {pid}) holding port {port}");
            if !PROCS.terminate(*pid) {
                debug!("could not signal pid {pid}, it may already be gone");
            }
        }
        let remaining = PROCS.wait_for_exit(&pids, self.grace).await;
        if remaining.is_empty() {
            info!("port {port} reclaimed");
            Reclaim::Reclaimed { pids }
        } else {
            let reason = format!(
                "pids {remaining:?} still hold port {port} after {}",
                humantime::format_duration(self.grace)
            );
            warn!("{reason}; continuing anyway");
            Reclaim::Failed { reason }
        }
    }
}

fn owners_of(
    listeners: impl IntoIterator<Item = listeners::Listener>,
    port: u16,
    me: u32,
) -> Vec<u32> {
    listeners
        .into_iter()
        .filter(|l| l.socket.port() == port && l.protocol == listeners::Protocol::TCP)
        .map(|l| l.process.pid)
        .filter(|pid| *pid != me)
        .collect()
}
