//! Supervisor - runs one launch from lock acquisition to cleanup
//!
//! This module is split into focused submodules:
//! - `phase`: the launch state machine
//! - `service`: spawning and waiting on the service process
//! - `signals`: signal dispositions before and after spawn

mod phase;
mod service;
pub(crate) mod signals;

pub use phase::Phase;
pub use service::{ServiceProcess, ServiceSpec, ServiceState, exit_code};

use crate::daemonize::{self, Daemonizer, Detach, DetachedStatus, DetachedSupervisor};
use crate::error::LaunchError;
use crate::lock::{Acquire, LockGuard, LockManager};
use crate::port::{PortReclaimer, Reclaim, is_port_open};
use crate::readiness::{ProbeConfig, ReadinessProbe, ReadinessState};
use crate::state_file::StateFiles;
use crate::{Result, env};
use signals::Propagation;
use std::time::Duration;
use tokio::select;

/// How long the service gets to exit after a forwarded termination signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub service: ServiceSpec,
    pub probe: ProbeConfig,
    pub files: StateFiles,
    /// Terminate an unhealthy listener that holds the port before spawning
    pub reclaim_port: bool,
    /// Stop the service when readiness times out instead of leaving it running
    pub kill_on_timeout: bool,
    pub daemon: bool,
}

/// How a launch ended. Every variant maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Another live supervisor holds the lock
    Contended { pid: Option<u32> },
    /// A healthy service already answers on the port
    AlreadyRunning,
    /// This process forked a background supervisor and is done
    Detached {
        pid: u32,
        status: DetachedStatus,
    },
    /// Service exited after readiness resolved
    Exited(i32),
    /// Service exited before it became ready
    Crashed(i32),
    TimedOut,
    /// A termination signal ended the launch
    Terminated(i32),
}

impl LaunchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Contended { .. } | LaunchOutcome::AlreadyRunning => 0,
            LaunchOutcome::Detached { status, .. } => status.exit_code(),
            LaunchOutcome::Exited(code) | LaunchOutcome::Crashed(code) => *code,
            LaunchOutcome::TimedOut => 1,
            LaunchOutcome::Terminated(signo) => 128 + signo,
        }
    }
}

pub struct Supervisor {
    opts: LaunchOptions,
    phase: Phase,
}

impl Supervisor {
    pub fn new(opts: LaunchOptions) -> Self {
        Self {
            opts,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            warn!("unexpected phase change {} -> {next}", self.phase);
        }
        debug!("phase: {} -> {next}", self.phase);
        self.phase = next;
    }

    /// Runs one launch to completion. Blocking: the async runtime is only
    /// built after a possible fork, so this must not be called from within
    /// a runtime.
    pub fn run(mut self) -> Result<LaunchOutcome> {
        self.advance(Phase::Acquiring);
        let lock = LockManager::new(self.opts.files.clone());
        let mut guard = match lock.acquire()? {
            Acquire::Acquired(guard) => guard,
            Acquire::Contended { pid } => {
                self.advance(Phase::Cleanup);
                self.advance(Phase::Idle);
                return Ok(LaunchOutcome::Contended { pid });
            }
        };
        signals::shield();

        if self.opts.daemon {
            let daemonizer = Daemonizer::new(env::TETHER_SERVICE_LOG.clone());
            match daemonizer.detach()? {
                Detach::Parent { child } => {
                    guard.hand_off();
                    return self.await_detached(child);
                }
                Detach::Child => {
                    guard.transfer_to(std::process::id())?;
                    self.opts.service.null_stdin = true;
                }
            }
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|source| LaunchError::Runtime { source })?;
        let outcome = runtime.block_on(self.supervise());
        self.cleanup(&mut guard);
        let outcome = outcome?;
        info!(
            "launch finished: {outcome:?} (exit code {})",
            outcome.exit_code()
        );
        Ok(outcome)
    }

    async fn supervise(&mut self) -> Result<LaunchOutcome> {
        let probe = ReadinessProbe::new(self.opts.probe.clone());
        let (host, port) = (probe.config().host.clone(), probe.config().port);

        if is_port_open(&host, port, probe.config().probe_timeout).await {
            if probe.check().await {
                info!("a healthy service already answers on port {port}, not starting another");
                return Ok(LaunchOutcome::AlreadyRunning);
            }
            if self.opts.reclaim_port {
                self.advance(Phase::Reclaiming);
                if let Reclaim::Failed { reason } = PortReclaimer::default().reclaim(port).await {
                    debug!("port reclaim incomplete: {reason}");
                }
            } else {
                warn!("port {port} is held by an unhealthy listener; not reclaiming");
            }
        }

        self.advance(Phase::Spawning);
        let mut service = ServiceProcess::spawn(&self.opts.service, &self.opts.files)?;
        let mut signals = match Propagation::install() {
            Ok(signals) => signals,
            Err(e) => {
                service.stop(SHUTDOWN_GRACE).await;
                return Err(e.into());
            }
        };

        self.advance(Phase::Probing);
        let state = select! {
            state = probe.await_ready(&mut service) => state,
            signo = signals.recv() => {
                return Ok(self.terminate(&mut service, &mut signals, signo).await);
            }
        };

        match state {
            ReadinessState::Failed(code) => {
                self.advance(Phase::Crashed(code));
                Ok(LaunchOutcome::Crashed(code))
            }
            ReadinessState::Starting | ReadinessState::TimedOut => {
                if self.opts.kill_on_timeout {
                    warn!("stopping service pid {} after readiness timeout", service.pid);
                    service.stop(SHUTDOWN_GRACE).await;
                } else {
                    warn!(
                        "service pid {} did not become ready; leaving it running",
                        service.pid
                    );
                }
                Ok(LaunchOutcome::TimedOut)
            }
            ReadinessState::Ready => {
                self.advance(Phase::Ready);
                select! {
                    code = service.wait() => {
                        info!("service exited with code {code}");
                        self.advance(Phase::Exited(code));
                        Ok(LaunchOutcome::Exited(code))
                    }
                    signo = signals.recv() => {
                        Ok(self.terminate(&mut service, &mut signals, signo).await)
                    }
                }
            }
        }
    }

    /// Forwards `signo` to the service and waits for it to go away. A second
    /// signal skips the grace period.
    async fn terminate(
        &mut self,
        service: &mut ServiceProcess,
        signals: &mut Propagation,
        signo: i32,
    ) -> LaunchOutcome {
        info!("forwarding signal {signo} to service pid {}", service.pid);
        service.forward(signo);
        select! {
            waited = tokio::time::timeout(SHUTDOWN_GRACE, service.wait()) => {
                if waited.is_err() {
                    warn!("service did not exit within {}", humantime::format_duration(SHUTDOWN_GRACE));
                    service.kill().await;
                }
            }
            _ = signals.recv() => {
                warn!("received second signal");
                service.kill().await;
            }
        }
        LaunchOutcome::Terminated(signo)
    }

    /// Launching side of a daemon-mode fork: wait briefly for the port, then
    /// report without waiting on the long-running supervisor.
    fn await_detached(&mut self, child: DetachedSupervisor) -> Result<LaunchOutcome> {
        let probe = &self.opts.probe;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| LaunchError::Runtime { source })?;
        #[cfg(unix)]
        let status = runtime.block_on(daemonize::await_detached(
            child,
            &probe.host,
            probe.port,
            probe.interval,
            probe.budget(),
        ));
        #[cfg(not(unix))]
        let status = DetachedStatus::Pending;
        match status {
            DetachedStatus::Listening => {
                info!("supervisor {} running in background", child.pid)
            }
            DetachedStatus::Exited(code) => {
                info!("background supervisor {} exited with code {code}", child.pid)
            }
            DetachedStatus::Pending => warn!(
                "supervisor {} is still starting; see {}",
                child.pid,
                env::TETHER_SERVICE_LOG.display()
            ),
        }
        self.phase = Phase::Idle;
        Ok(LaunchOutcome::Detached {
            pid: child.pid,
            status,
        })
    }

    fn cleanup(&mut self, guard: &mut LockGuard) {
        self.advance(Phase::Cleanup);
        guard.release();
        self.advance(Phase::Idle);
    }
}
