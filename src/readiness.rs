//! Bounded readiness polling.
//!
//! Each attempt connects to the service port and, when a health path is
//! configured, additionally requires `GET <health path>` to answer 200. The
//! child is watched the whole time: if it exits, polling stops at once.

use crate::port::is_port_open;
use std::future::Future;
use std::time::Duration;
use tokio::select;
use tokio::time::{self, Instant};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HEALTH_PATH: &str = "/api/auth/team/status";
pub const DEFAULT_ATTEMPTS: u32 = 30;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound for a single connect or HTTP exchange
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIs)]
#[strum(serialize_all = "snake_case")]
pub enum ReadinessState {
    Starting,
    Ready,
    /// The child exited while we were polling; carries its exit code
    Failed(i32),
    TimedOut,
}

/// Something that exits eventually, observed while polling.
pub trait ExitWatch {
    /// Resolves with the exit code once the process has exited. Must be
    /// cancel-safe; it is raced against probe attempts.
    fn exited(&mut self) -> impl Future<Output = i32> + Send;
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    pub health_path: Option<String>,
    pub max_attempts: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            health_path: Some(DEFAULT_HEALTH_PATH.to_string()),
            max_attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

impl ProbeConfig {
    /// Worst-case wall-clock time for [`ReadinessProbe::await_ready`]
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    pub fn health_url(&self) -> Option<String> {
        self.health_path.as_ref().map(|path| {
            let path = if path.starts_with('/') {
                path.clone()
            } else {
                format!("/{path}")
            };
            format!("http://{}:{}{path}", self.host, self.port)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    config: ProbeConfig,
    client: reqwest::Client,
}

impl ReadinessProbe {
    pub fn new(config: ProbeConfig) -> Self {
        let timeout = attempt_timeout(&config);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                warn!("could not configure health check client: {e}");
                reqwest::Client::new()
            });
        Self { config, client }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// A single probe: TCP connect, then the health check if configured
    pub async fn check(&self) -> bool {
        let timeout = attempt_timeout(&self.config);
        if !is_port_open(&self.config.host, self.config.port, timeout).await {
            return false;
        }
        let Some(url) = self.config.health_url() else {
            return true;
        };
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                trace!("health check {url}: status {} (not ready)", response.status());
                false
            }
            Err(e) => {
                trace!("health check {url} failed: {e}");
                false
            }
        }
    }

    /// Polls until ready, the child exits, or attempts run out. Attempt `k`
    /// starts at `(k - 1) * interval`, and each attempt is cut off at the
    /// interval, so this always returns within `max_attempts * interval`.
    pub async fn await_ready<W: ExitWatch>(&self, child: &mut W) -> ReadinessState {
        let config = &self.config;
        let start = Instant::now();
        let per_attempt = attempt_timeout(config);
        let mut state = ReadinessState::Starting;
        for attempt in 1..=config.max_attempts {
            let check = time::timeout(per_attempt, self.check());
            select! {
                code = child.exited() => {
                    info!("service exited with code {code} before becoming ready");
                    return ReadinessState::Failed(code);
                }
                ready = check => {
                    if matches!(ready, Ok(true)) {
                        info!(
                            "service ready on port {} after {attempt} attempt(s)",
                            config.port
                        );
                        state = ReadinessState::Ready;
                        break;
                    }
                    debug!("readiness attempt {attempt}/{} failed", config.max_attempts);
                }
            }
            if attempt == config.max_attempts {
                break;
            }
            let next = start + config.interval.saturating_mul(attempt);
            select! {
                code = child.exited() => {
                    info!("service exited with code {code} before becoming ready");
                    return ReadinessState::Failed(code);
                }
                _ = time::sleep_until(next) => {}
            }
        }
        if state.is_starting() {
            warn!(
                "service not ready after {} attempts ({})",
                config.max_attempts,
                humantime::format_duration(start.elapsed())
            );
            state = ReadinessState::TimedOut;
        }
        state
    }
}

fn attempt_timeout(config: &ProbeConfig) -> Duration {
    std::cmp::min(config.probe_timeout, config.interval).max(Duration::from_millis(1))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ExitWatch;
    use std::time::Duration;
    use tokio::time::Instant;

    /// A process that exits with `code` at a fixed instant, or never.
    pub struct ScriptedExit {
        pub at: Option<(Instant, i32)>,
    }

    impl ScriptedExit {
        pub fn never() -> Self {
            Self { at: None }
        }

        pub fn after(delay: Duration, code: i32) -> Self {
            Self {
                at: Some((Instant::now() + delay, code)),
            }
        }
    }

    impl ExitWatch for ScriptedExit {
        async fn exited(&mut self) -> i32 {
            match self.at {
                Some((at, code)) => {
                    tokio::time::sleep_until(at).await;
                    code
                }
                None => std::future::pending().await,
            }
        }
    }
}
