//! Advisory single-instance lock.
//!
//! Mutual exclusion rests entirely on exclusive file creation: whoever creates
//! the lock file owns it. A record whose owner is no longer alive is stale and
//! gets reclaimed, with exactly one retry of the create.

use crate::error::LockError;
use crate::liveness::{LivenessOracle, SignalZero};
use crate::state_file::{LockFileState, StateFiles};
use std::io;
use std::path::Path;
use std::time::Duration;

/// A lock record younger than this without a readable pid is assumed to
/// belong to a launch that has not finished writing it yet.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Acquire {
    Acquired(LockGuard),
    /// Another live supervisor owns the lock. `pid` is None when its record
    /// was still being written.
    Contended { pid: Option<u32> },
}

#[derive(Debug)]
pub struct LockManager<O = SignalZero> {
    files: StateFiles,
    oracle: O,
}

impl LockManager<SignalZero> {
    pub fn new(files: StateFiles) -> Self {
        Self::with_oracle(files, SignalZero)
    }
}

impl<O: LivenessOracle> LockManager<O> {
    pub fn with_oracle(files: StateFiles, oracle: O) -> Self {
        Self { files, oracle }
    }

    pub fn files(&self) -> &StateFiles {
        &self.files
    }

    /// Tries to become the owner, recording `std::process::id()`
    pub fn acquire(&self) -> Result<Acquire, LockError> {
        self.acquire_as(std::process::id())
    }

    pub fn acquire_as(&self, pid: u32) -> Result<Acquire, LockError> {
        self.files.ensure_dirs()?;
        if self.try_create(pid)? {
            return Ok(self.acquired(pid));
        }
        if let Owner::Live(owner) = self.inspect_owner()? {
            info!("lock is held by live supervisor {owner:?}, nothing to do");
            return Ok(Acquire::Contended { pid: owner });
        }

        // Another launcher may be reclaiming the same stale record. Re-check
        // under the reclaim section so nobody deletes a fresh winner's lock.
        let _section = self.reclaim_section()?;
        match self.inspect_owner()? {
            Owner::Live(owner) => {
                debug!("stale lock was already reclaimed by {owner:?}");
                return Ok(Acquire::Contended { pid: owner });
            }
            Owner::Stale(owner) => {
                warn!(
                    "removing stale lock {} (owner {} is not running)",
                    self.files.lock_path().display(),
                    owner.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                );
                self.files.remove_lock()?;
                self.files.remove_pid()?;
            }
        }
        // one retry only
        if self.try_create(pid)? {
            return Ok(self.acquired(pid));
        }
        let winner = match self.files.read_lock() {
            LockFileState::Owned(record) => Some(record.pid),
            _ => None,
        };
        debug!("lost the race to reclaim the stale lock to {winner:?}");
        Ok(Acquire::Contended { pid: winner })
    }

    fn acquired(&self, pid: u32) -> Acquire {
        info!(
            "acquired lock {} as pid {pid}",
            self.files.lock_path().display()
        );
        Acquire::Acquired(LockGuard::new(self.files.clone(), pid))
    }

    fn try_create(&self, pid: u32) -> Result<bool, LockError> {
        match self.files.create_lock(pid) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Create {
                path: self.files.lock_path().to_path_buf(),
                source,
            }),
        }
    }

    /// Cross-process lock keyed on the lock file's directory, held while a
    /// stale record is replaced. The kernel drops it if we die.
    fn reclaim_section(&self) -> Result<xx::fslock::LockFile, LockError> {
        let lock_path = self.files.lock_path();
        let dir = match lock_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let section = xx::fslock::get(dir, false).map_err(|source| LockError::Reclaim {
            path: lock_path.to_path_buf(),
            source,
        })?;
        section.ok_or_else(|| LockError::Reclaim {
            path: lock_path.to_path_buf(),
            source: xx::XXError::Error("no lock was taken".to_string()),
        })
    }

    fn inspect_owner(&self) -> Result<Owner, LockError> {
        match self.files.read_lock() {
            // vanished between create and read, so nobody owns it
            LockFileState::Missing => Ok(Owner::Stale(None)),
            LockFileState::Owned(record) => {
                let alive = self
                    .oracle
                    .is_alive(record.pid)
                    .map_err(|source| LockError::Probe {
                        pid: record.pid,
                        source,
                    })?;
                if alive {
                    Ok(Owner::Live(Some(record.pid)))
                } else {
                    Ok(Owner::Stale(Some(record.pid)))
                }
            }
            LockFileState::Unreadable { age } => match age {
                Some(age) if age >= UNREADABLE_GRACE => Ok(Owner::Stale(None)),
                _ => Ok(Owner::Live(None)),
            },
        }
    }
}

enum Owner {
    Live(Option<u32>),
    Stale(Option<u32>),
}

/// Proof of lock ownership. Dropping it (or calling [`LockGuard::release`])
/// removes both the pid and lock artifacts exactly once.
#[derive(Debug)]
pub struct LockGuard {
    files: StateFiles,
    owner: u32,
    released: bool,
}

impl LockGuard {
    fn new(files: StateFiles, owner: u32) -> Self {
        Self {
            files,
            owner,
            released: false,
        }
    }

    pub fn files(&self) -> &StateFiles {
        &self.files
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Records a new owner, used when the supervisor continues in a forked
    /// child.
    pub fn transfer_to(&mut self, pid: u32) -> Result<(), LockError> {
        self.files.rewrite_lock(pid)?;
        debug!("lock ownership transferred from {} to {pid}", self.owner);
        self.owner = pid;
        Ok(())
    }

    /// Gives up responsibility for cleanup without touching the artifacts.
    /// The process that took over the lock removes them instead.
    pub fn hand_off(mut self) {
        self.released = true;
    }

    /// Removes the pid and lock artifacts. Safe to call repeatedly; only the
    /// first call does anything.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.files.remove_pid() {
            warn!("{e}");
        }
        match self.files.remove_lock() {
            Ok(()) => debug!("released lock {}", self.files.lock_path().display()),
            Err(e) => warn!("{e}"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::test_support::FakeProcesses;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn manager(dir: &TempDir, alive: &[u32]) -> LockManager<FakeProcesses> {
        LockManager::with_oracle(
            StateFiles::in_dir(dir.path()),
            FakeProcesses::with_alive(alive),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[]);
        let Acquire::Acquired(mut guard) = lm.acquire_as(10).unwrap() else {
            panic!("expected to acquire");
        };
        assert_eq!(guard.owner(), 10);
        assert_eq!(fs::read_to_string(lm.files().lock_path()).unwrap(), "10\n");
        lm.files().write_pid(11).unwrap();

        guard.release();
        guard.release();
        assert!(!lm.files().lock_path().exists());
        assert!(!lm.files().pid_path().exists());
    }

    #[test]
    fn test_live_owner_is_contended() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[10]);
        let _guard = match lm.acquire_as(10).unwrap() {
            Acquire::Acquired(g) => g,
            other => panic!("unexpected: {other:?}"),
        };
        match lm.acquire_as(20).unwrap() {
            Acquire::Contended { pid } => assert_eq!(pid, Some(10)),
            other => panic!("unexpected: {other:?}"),
        }
        // the loser must not have disturbed the owner's record
        assert_eq!(fs::read_to_string(lm.files().lock_path()).unwrap(), "10\n");
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[]);
        fs::write(lm.files().lock_path(), "99999\n").unwrap();
        fs::write(lm.files().pid_path(), "99998\n").unwrap();

        let Acquire::Acquired(guard) = lm.acquire_as(20).unwrap() else {
            panic!("stale lock should be reclaimed");
        };
        assert_eq!(fs::read_to_string(lm.files().lock_path()).unwrap(), "20\n");
        assert!(!lm.files().pid_path().exists());
        drop(guard);
        assert!(!lm.files().lock_path().exists());
    }

    #[test]
    fn test_owner_dies_then_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let oracle = FakeProcesses::with_alive(&[10]);
        let lm = LockManager::with_oracle(StateFiles::in_dir(dir.path()), &oracle);
        let Acquire::Acquired(first) = lm.acquire_as(10).unwrap() else {
            panic!("expected to acquire");
        };
        assert!(matches!(
            lm.acquire_as(20).unwrap(),
            Acquire::Contended { .. }
        ));

        // simulate a crash: the owner vanishes without cleaning up
        first.hand_off();
        oracle.kill(10);
        assert!(matches!(lm.acquire_as(20).unwrap(), Acquire::Acquired(_)));
    }

    #[test]
    fn test_fresh_unreadable_record_is_contended() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[]);
        fs::write(lm.files().lock_path(), "").unwrap();
        match lm.acquire_as(20).unwrap() {
            Acquire::Contended { pid } => assert_eq!(pid, None),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(lm.files().lock_path().exists());
    }

    #[test]
    fn test_transfer_rewrites_owner() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[]);
        let Acquire::Acquired(mut guard) = lm.acquire_as(10).unwrap() else {
            panic!("expected to acquire");
        };
        guard.transfer_to(77).unwrap();
        assert_eq!(guard.owner(), 77);
        assert_eq!(fs::read_to_string(lm.files().lock_path()).unwrap(), "77\n");
    }

    #[test]
    fn test_hand_off_leaves_artifacts() {
        let dir = TempDir::new().unwrap();
        let lm = manager(&dir, &[]);
        let Acquire::Acquired(guard) = lm.acquire_as(10).unwrap() else {
            panic!("expected to acquire");
        };
        guard.hand_off();
        assert!(lm.files().lock_path().exists());
    }

    #[test]
    fn test_concurrent_reclaim_has_single_winner() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        fs::write(files.lock_path(), "99999\n").unwrap();

        // every contender is considered alive once it has written its record
        let contenders: Vec<u32> = (1..=8).collect();
        let oracle = Arc::new(FakeProcesses::with_alive(&contenders));
        let barrier = Arc::new(Barrier::new(contenders.len()));
        let handles = contenders
            .iter()
            .map(|pid| {
                let pid = *pid;
                let files = files.clone();
                let oracle = oracle.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let lm = LockManager::with_oracle(files, &*oracle);
                    barrier.wait();
                    match lm.acquire_as(pid).unwrap() {
                        Acquire::Acquired(guard) => {
                            guard.hand_off();
                            true
                        }
                        Acquire::Contended { .. } => false,
                    }
                })
            })
            .collect::<Vec<_>>();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_reclaim_waits_for_section() {
        let dir = TempDir::new().unwrap();
        let files = StateFiles::in_dir(dir.path());
        fs::write(files.lock_path(), "99999\n").unwrap();
        let holder = LockManager::with_oracle(files.clone(), FakeProcesses::default());
        let section = holder.reclaim_section().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let lm = LockManager::with_oracle(files, FakeProcesses::default());
            let acquired = matches!(lm.acquire_as(20).unwrap(), Acquire::Acquired(_));
            tx.send(acquired).unwrap();
        });
        // the stale record can't be replaced while another reclaim is running
        assert!(rx.recv_timeout(std::time::Duration::from_millis(300)).is_err());
        drop(section);
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }
}
