//! On-disk supervisor state: the lock artifact and the pid artifact.
//!
//! Both files hold a single decimal pid. They are the only durable record of
//! a running supervisor and must both be gone once it exits.

use crate::env;
use crate::error::LockError;
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Locations of the supervisor's persisted state, passed explicitly through
/// the launch context.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StateFiles {
    lock_path: PathBuf,
    pid_path: PathBuf,
}

/// What a lock file says about its owner.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LockRecord {
    pub path: PathBuf,
    pub pid: u32,
    pub acquired_at: Option<DateTime<Local>>,
}

/// Result of reading the lock artifact.
#[derive(Debug)]
pub enum LockFileState {
    Missing,
    Owned(LockRecord),
    /// Present but holding no parsable pid
    Unreadable { age: Option<std::time::Duration> },
}

impl Default for StateFiles {
    fn default() -> Self {
        Self::new(env::TETHER_LOCK_FILE.clone(), env::TETHER_PID_FILE.clone())
    }
}

impl StateFiles {
    pub fn new(lock_path: PathBuf, pid_path: PathBuf) -> Self {
        Self {
            lock_path,
            pid_path,
        }
    }

    /// Both artifacts inside `dir`, using the default file names
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("tether.lock"), dir.join("tether.pid"))
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn ensure_dirs(&self) -> Result<(), LockError> {
        for path in [&self.lock_path, &self.pid_path] {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                xx::file::mkdirp(parent).map_err(|e| LockError::Create {
                    path: path.clone(),
                    source: io::Error::other(e.to_string()),
                })?;
            }
        }
        Ok(())
    }

    /// Exclusively creates the lock file and records `pid` in it. Fails with
    /// `AlreadyExists` when another record is present.
    pub fn create_lock(&self, pid: u32) -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let mut file = options.open(&self.lock_path)?;
        if let Err(err) = writeln!(file, "{pid}").and_then(|()| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&self.lock_path);
            return Err(err);
        }
        Ok(())
    }

    /// Replaces the owner recorded in an existing lock file
    pub fn rewrite_lock(&self, pid: u32) -> Result<(), LockError> {
        write_pid(&self.lock_path, pid).map_err(|source| LockError::Write {
            path: self.lock_path.clone(),
            source,
        })
    }

    pub fn read_lock(&self) -> LockFileState {
        let raw = match fs::read_to_string(&self.lock_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return LockFileState::Missing,
            Err(e) => {
                warn!("could not read lock file {}: {e}", self.lock_path.display());
                String::new()
            }
        };
        let modified = fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok();
        match parse_pid(&raw) {
            Some(pid) => LockFileState::Owned(LockRecord {
                path: self.lock_path.clone(),
                pid,
                acquired_at: modified.map(DateTime::<Local>::from),
            }),
            None => LockFileState::Unreadable {
                age: modified.and_then(|m| m.elapsed().ok()),
            },
        }
    }

    pub fn write_pid(&self, pid: u32) -> io::Result<()> {
        write_pid(&self.pid_path, pid)
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_path)
            .ok()
            .and_then(|raw| parse_pid(&raw))
    }

    pub fn remove_lock(&self) -> Result<(), LockError> {
        remove_if_present(&self.lock_path)
    }

    pub fn remove_pid(&self) -> Result<(), LockError> {
        remove_if_present(&self.pid_path)
    }
}

fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

fn parse_pid(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|pid| *pid != 0)
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}
