use crate::Result;
use crate::cli::StateArgs;
use crate::error::LaunchError;
use crate::readiness::{
    DEFAULT_ATTEMPTS, DEFAULT_HEALTH_PATH, DEFAULT_PORT, PROBE_TIMEOUT, ProbeConfig,
};
use crate::supervisor::{LaunchOptions, ServiceSpec, Supervisor};
use std::path::PathBuf;
use std::time::Duration;

/// Environment every service starts with unless overridden with --env
const DEFAULT_ENV: &[(&str, &str)] = &[("NODE_ENV", "development")];
const DEFAULT_COMMAND: &[&str] = &["npm", "run", "dev"];

/// Starts the service unless an instance is already running
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Starts the service unless an instance is already running

Takes the single-instance lock, frees the port if an unhealthy process holds
it, spawns the service and polls it until it answers. In the foreground the
exit code is the service's own exit code. A launch that finds another live
supervisor, or a healthy service already on the port, exits 0 without
starting anything. A service that never becomes ready exits 1.

Examples:
  tether start                              Run `npm run dev` on port 5000
  tether start -p 8080 -- cargo run         Supervise a different command
  tether start --no-health -- ./server      Only wait for the TCP port
  tether start -d                           Detach into the background"
)]
pub struct Start {
    /// Port the service listens on
    #[clap(short, long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Host used for readiness probes
    #[clap(long, env = "TETHER_HOST", default_value = "127.0.0.1")]
    host: String,
    /// HTTP path that must answer 200 for the service to count as ready
    #[clap(long, env = "TETHER_HEALTH_PATH", default_value = DEFAULT_HEALTH_PATH)]
    health_path: String,
    /// Only require the port to accept connections
    #[clap(long)]
    no_health: bool,
    /// Readiness attempts before giving up
    #[clap(long, env = "TETHER_ATTEMPTS", default_value_t = DEFAULT_ATTEMPTS)]
    attempts: u32,
    /// Delay between readiness attempts (e.g. 500ms, 2s)
    #[clap(long, env = "TETHER_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    interval: Duration,
    /// Extra environment for the service, as KEY=VALUE (repeatable)
    #[clap(short = 'e', long = "env", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// Working directory for the service
    #[clap(short = 'C', long)]
    dir: Option<PathBuf>,
    /// Detach from the terminal and keep supervising in the background
    #[clap(short, long)]
    daemon: bool,
    /// Leave an unhealthy listener on the port alone
    #[clap(long)]
    no_reclaim: bool,
    /// Stop the service if it never becomes ready
    #[clap(long, env = "TETHER_KILL_ON_TIMEOUT")]
    kill_on_timeout: bool,
    #[clap(flatten)]
    state: StateArgs,
    /// Service command, after `--` [default: npm run dev]
    #[clap(last = true)]
    command: Vec<String>,
}

impl Start {
    pub fn run(self) -> Result<i32> {
        let opts = self.options()?;
        debug!(
            "launching `{}` on port {}",
            opts.service.display(),
            opts.probe.port
        );
        let outcome = Supervisor::new(opts).run()?;
        Ok(outcome.exit_code())
    }

    fn options(&self) -> Result<LaunchOptions, LaunchError> {
        let command = if self.command.is_empty() {
            DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            self.command.clone()
        };
        Ok(LaunchOptions {
            service: ServiceSpec {
                command,
                env: env_overlay(&self.overrides)?,
                dir: self.dir.clone(),
                null_stdin: self.daemon,
            },
            probe: ProbeConfig {
                host: self.host.clone(),
                port: self.port,
                health_path: (!self.no_health).then(|| self.health_path.clone()),
                max_attempts: self.attempts.max(1),
                interval: self.interval,
                probe_timeout: PROBE_TIMEOUT,
            },
            files: self.state.files(),
            reclaim_port: !self.no_reclaim,
            kill_on_timeout: self.kill_on_timeout,
            daemon: self.daemon,
        })
    }
}

/// Defaults first, then the user's overrides; later entries win.
fn env_overlay(overrides: &[String]) -> Result<Vec<(String, String)>, LaunchError> {
    let mut overlay: Vec<(String, String)> = DEFAULT_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for raw in overrides {
        let Some((key, value)) = raw.split_once('=').filter(|(k, _)| !k.is_empty()) else {
            return Err(LaunchError::InvalidEnv { raw: raw.clone() });
        };
        overlay.retain(|(k, _)| k != key);
        overlay.push((key.to_string(), value.to_string()));
    }
    Ok(overlay)
}
