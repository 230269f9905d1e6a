//! Mutual exclusion via directory creation.
//!
//! `mkdir` is atomic on every POSIX filesystem, survives process crashes
//! without leaving advisory-lock garbage, and is inspectable by operators.
//! Per-resource locks expire by directory mtime; the global supervisor lock
//! additionally records the holder's PID and process start signature so a
//! stale lock is reclaimed only when the recorded holder is verifiably gone
//! (PID reuse is not good enough to steal the supervisor role).

use crate::proc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another live, verified supervisor owns the global lock.
    #[error("supervisor already running (pid {pid}, started {started_at})")]
    AlreadyRunning { pid: u32, started_at: String },

    #[error("lock io error: {0}")]
    Io(#[from] io::Error),
}

/// Tries to take a per-resource lock. Returns `None` without blocking when
/// the lock is held and fresh; the caller skips this tick for the resource.
///
/// A lock directory older than `stale` is reclaimed: removed and re-created.
pub fn try_acquire(path: &Path, stale: Duration) -> io::Result<Option<DirLock>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::create_dir(path) {
        Ok(()) => Ok(Some(DirLock::held(path))),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let age = dir_age(path);
            if age.is_some_and(|a| a > stale) {
                tracing::warn!(
                    lock = %path.display(),
                    age_secs = age.map(|a| a.as_secs()),
                    "reclaiming stale lock"
                );
                let _ = fs::remove_dir_all(path);
                match fs::create_dir(path) {
                    Ok(()) => Ok(Some(DirLock::held(path))),
                    // Lost the reclamation race to another process.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
                    Err(e) => Err(e),
                }
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(e),
    }
}

/// Removes a lock directory. Missing is not an error.
pub fn release(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(lock = %path.display(), error = %e, "failed to release lock"),
    }
}

fn dir_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    modified.elapsed().ok()
}

/// A held per-resource lock, released on drop. Release is idempotent.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    released: bool,
}

impl DirLock {
    fn held(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if !self.released {
            release(&self.path);
            self.released = true;
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// The global supervisor lock: exactly one supervisor per state directory.
///
/// The lock directory carries three scalar files: `pid`, `start_sig`
/// (unix start time of the holder process) and `started_at` (human-readable
/// acquisition time). A newcomer finding the directory verifies the holder
/// by matching PID and start signature; mismatch or absence means the
/// holder died and the lock may be reclaimed.
#[derive(Debug)]
pub struct GlobalLock {
    path: PathBuf,
    released: bool,
}

impl GlobalLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::create_dir(path) {
            Ok(()) => {
                Self::write_owner(path)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    released: false,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some((pid, started_at)) = Self::live_holder(path) {
                    return Err(LockError::AlreadyRunning { pid, started_at });
                }
                tracing::warn!(lock = %path.display(), "reclaiming global lock from dead holder");
                fs::remove_dir_all(path)?;
                match fs::create_dir(path) {
                    Ok(()) => {
                        Self::write_owner(path)?;
                        Ok(Self {
                            path: path.to_path_buf(),
                            released: false,
                        })
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // Someone else won the reclamation race; report them.
                        let (pid, started_at) = Self::live_holder(path)
                            .unwrap_or((0, "unknown".to_string()));
                        Err(LockError::AlreadyRunning { pid, started_at })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_owner(path: &Path) -> io::Result<()> {
        let pid = std::process::id();
        fs::write(path.join("pid"), format!("{pid}\n"))?;
        let sig = proc::process_start_time(pid).unwrap_or(0);
        fs::write(path.join("start_sig"), format!("{sig}\n"))?;
        fs::write(
            path.join("started_at"),
            format!("{}\n", chrono::Utc::now().to_rfc3339()),
        )
    }

    /// Returns the holder `(pid, started_at)` when it is alive and its start
    /// signature matches the recorded one.
    fn live_holder(path: &Path) -> Option<(u32, String)> {
        let pid: u32 = fs::read_to_string(path.join("pid"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let recorded_sig: u64 = fs::read_to_string(path.join("start_sig"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if !proc::pid_alive(pid) {
            return None;
        }
        let actual_sig = proc::process_start_time(pid)?;
        // ±2s tolerance: clock sources for process start time differ slightly.
        if actual_sig.abs_diff(recorded_sig) > 2 {
            return None;
        }
        let started_at = fs::read_to_string(path.join("started_at"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Some((pid, started_at))
    }

    pub fn release(&mut self) {
        if !self.released {
            release(&self.path);
            self.released = true;
        }
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        self.release();
    }
}
