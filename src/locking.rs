//! Advisory file locking
//!
//! Three user-visible lock states transition linearly:
//! UNLOCKED → SHARED (before any read) → RESERVED (at the first dirty page;
//! at most one holder, readers may coexist) → EXCLUSIVE (just before new
//! page images reach the main file).
//!
//! Realized with fs2 advisory locks: shared/exclusive on the database file
//! itself, plus an exclusive lock on a sidecar `<db>-reserved` file for the
//! RESERVED state. Only the single RESERVED holder ever attempts the
//! shared→exclusive upgrade, so the upgrade cannot deadlock. Acquisition
//! failures surface as `BUSY` after bounded retry with jittered backoff.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use rand::Rng;

use crate::error::{Error, Result};

/// Default deadline for lock acquisition before giving up with `BUSY`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_BASE: Duration = Duration::from_millis(5);
const RETRY_MAX: Duration = Duration::from_millis(100);

/// Lock state held by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockState {
    Unlocked,
    Shared,
    Reserved,
    Exclusive,
}

/// Sidecar file whose exclusive lock represents the RESERVED state.
fn reserved_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-reserved");
    PathBuf::from(name)
}

/// Advisory lock manager for one connection to one database file
#[derive(Debug)]
pub struct LockManager {
    db_file: File,
    reserved_file: File,
    state: LockState,
    busy_timeout: Duration,
}

impl LockManager {
    /// Open (creating if needed) the lock handles for a database file. Each
    /// connection gets its own file descriptions, so locks of different
    /// connections are independent even within one process.
    pub fn open(db_path: &Path) -> Result<LockManager> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;
        let reserved_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(reserved_path(db_path))?;
        Ok(LockManager {
            db_file,
            reserved_file,
            state: LockState::Unlocked,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Change the deadline after which acquisition fails with `BUSY`.
    pub fn set_busy_timeout(&mut self, timeout: Duration) {
        self.busy_timeout = timeout;
    }

    /// Retry `attempt` with jittered backoff until the deadline passes.
    fn retry_until_deadline(
        &self,
        mut attempt: impl FnMut() -> std::io::Result<()>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.busy_timeout;
        let mut backoff = RETRY_BASE;
        loop {
            match attempt() {
                Ok(()) => return Ok(()),
                Err(_) if Instant::now() < deadline => {
                    let jitter = rand::thread_rng().gen_range(0..backoff.as_millis().max(1) as u64);
                    std::thread::sleep(backoff + Duration::from_millis(jitter));
                    backoff = (backoff * 2).min(RETRY_MAX);
                }
                Err(_) => {
                    log::warn!("lock acquisition timed out after {:?}", self.busy_timeout);
                    return Err(Error::Busy);
                }
            }
        }
    }

    /// UNLOCKED → SHARED. Idempotent for any state at SHARED or above.
    pub fn acquire_shared(&mut self) -> Result<()> {
        if self.state >= LockState::Shared {
            return Ok(());
        }
        let file = &self.db_file;
        self.retry_until_deadline(|| FileExt::try_lock_shared(file))?;
        self.state = LockState::Shared;
        Ok(())
    }

    /// SHARED → RESERVED: announce write intent. At most one connection can
    /// hold RESERVED; existing readers are unaffected.
    pub fn acquire_reserved(&mut self) -> Result<()> {
        if self.state >= LockState::Reserved {
            return Ok(());
        }
        if self.state < LockState::Shared {
            return Err(Error::Internal(
                "RESERVED requested without SHARED".to_string(),
            ));
        }
        let file = &self.reserved_file;
        self.retry_until_deadline(|| FileExt::try_lock_exclusive(file))?;
        self.state = LockState::Reserved;
        Ok(())
    }

    /// RESERVED → EXCLUSIVE: wait out the remaining readers. Only ever
    /// attempted by the RESERVED holder.
    pub fn acquire_exclusive(&mut self) -> Result<()> {
        if self.state >= LockState::Exclusive {
            return Ok(());
        }
        if self.state < LockState::Reserved {
            return Err(Error::Internal(
                "EXCLUSIVE requested without RESERVED".to_string(),
            ));
        }
        let file = &self.db_file;
        self.retry_until_deadline(|| FileExt::try_lock_exclusive(file))?;
        self.state = LockState::Exclusive;
        Ok(())
    }

    /// Acquire EXCLUSIVE from any state; used for recovery at open time,
    /// before ordinary transactions exist.
    pub fn acquire_exclusive_raw(&mut self) -> Result<()> {
        let file = &self.db_file;
        self.retry_until_deadline(|| FileExt::try_lock_exclusive(file))?;
        let reserved = &self.reserved_file;
        self.retry_until_deadline(|| FileExt::try_lock_exclusive(reserved))?;
        self.state = LockState::Exclusive;
        Ok(())
    }

    /// Whether no connection currently holds the RESERVED lock. A journal
    /// on disk is "hot" (needs recovery) only when its writer is gone, i.e.
    /// the reserved lock is free. Only meaningful below RESERVED.
    pub fn reserved_lock_is_free(&self) -> bool {
        debug_assert!(self.state < LockState::Reserved);
        match FileExt::try_lock_exclusive(&self.reserved_file) {
            Ok(()) => {
                let _ = FileExt::unlock(&self.reserved_file);
                true
            }
            Err(_) => false,
        }
    }

    /// Release everything back to UNLOCKED.
    pub fn unlock(&mut self) {
        if self.state >= LockState::Reserved {
            let _ = FileExt::unlock(&self.reserved_file);
        }
        if self.state >= LockState::Shared {
            let _ = FileExt::unlock(&self.db_file);
        }
        self.state = LockState::Unlocked;
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.unlock();
    }
}
