use once_cell::sync::Lazy;
pub use std::env::*;
use std::path::PathBuf;

pub static HOME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir().unwrap_or_else(|| {
        eprintln!("Warning: Could not determine home directory");
        PathBuf::from("/tmp")
    })
});
pub static TETHER_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    var_path("TETHER_STATE_DIR").unwrap_or(
        dirs::state_dir()
            .unwrap_or(HOME_DIR.join(".local").join("state"))
            .join("tether"),
    )
});
pub static TETHER_LOCK_FILE: Lazy<PathBuf> = Lazy::new(|| TETHER_STATE_DIR.join("tether.lock"));
pub static TETHER_PID_FILE: Lazy<PathBuf> = Lazy::new(|| TETHER_STATE_DIR.join("tether.pid"));
pub static TETHER_LOG: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("TETHER_LOG").unwrap_or(log::LevelFilter::Info));
pub static TETHER_LOG_FILE_LEVEL: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("TETHER_LOG_FILE_LEVEL").unwrap_or(*TETHER_LOG));
pub static TETHER_LOGS_DIR: Lazy<PathBuf> =
    Lazy::new(|| var_path("TETHER_LOGS_DIR").unwrap_or(TETHER_STATE_DIR.join("logs")));
pub static TETHER_LOG_FILE: Lazy<PathBuf> = Lazy::new(|| TETHER_LOGS_DIR.join("tether.log"));
/// Where a detached supervisor sends its own and the service's stdout/stderr
pub static TETHER_SERVICE_LOG: Lazy<PathBuf> = Lazy::new(|| TETHER_LOGS_DIR.join("service.log"));

// Capture the PATH at startup so the service can find user tools
pub static ORIGINAL_PATH: Lazy<Option<String>> = Lazy::new(|| var("PATH").ok());

fn var_path(name: &str) -> Option<PathBuf> {
    var(name).map(PathBuf::from).ok()
}

fn var_log_level(name: &str) -> Option<log::LevelFilter> {
    var(name).ok().and_then(|level| level.parse().ok())
}
