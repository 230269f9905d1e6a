//! Durable per-window state as small scalar files.
//!
//! Each state element is a single file holding one value, written via
//! write-to-temp-then-rename on the same directory so readers observe either
//! the old or the new content, never a torn write. Readers tolerate missing
//! or malformed files by returning defaults: the store must survive partial
//! writes from crashed predecessors.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads a scalar file, trimmed. `None` when missing or unreadable.
pub fn read_scalar(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Reads a numeric scalar, stripping any non-digit noise and defaulting to 0.
pub fn read_u64(path: &Path) -> u64 {
    read_scalar(path)
        .map(|s| {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Atomically writes a scalar: temp sibling, then rename into place.
///
/// The rename is atomic because the temp file lives in the target's own
/// directory. Content is newline-terminated.
pub fn write_scalar_atomic(path: &Path, value: &str) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    let mut content = value.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

pub fn write_u64_atomic(path: &Path, value: u64) -> io::Result<()> {
    write_scalar_atomic(path, &value.to_string())
}

/// Creates (or freshens) a flag file whose payload is the current unix time.
pub fn touch(path: &Path) -> io::Result<()> {
    write_u64_atomic(path, now_unix())
}

/// Removes a flag file. Missing is not an error.
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove state file"),
    }
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// mtime of a file as unix seconds, or `None` when missing.
pub fn mtime(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

/// Seconds since the file was last modified. `None` when missing.
pub fn file_age_seconds(path: &Path) -> Option<u64> {
    mtime(path).map(|m| now_unix().saturating_sub(m))
}

/// Removes regular files under `dir` older than `days` days. Returns the
/// number removed. Subdirectories are left alone.
pub fn gc_older_than(dir: &Path, days: u64) -> usize {
    let cutoff = days * 86_400;
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if file_age_seconds(&path).is_some_and(|age| age > cutoff) {
            remove(&path);
            removed += 1;
        }
    }
    removed
}

/// Per-window monitor snapshot, `state/<window>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub status: String,
    pub context_num: i64,
    pub head: String,
    pub commit_msg: String,
    pub commit_time: u64,
    pub commits_30m: u64,
    pub working_no_commit: u64,
    #[serde(default)]
    pub tokens_today: u64,
    pub last_check: u64,
}

impl Default for WindowSnapshot {
    fn default() -> Self {
        Self {
            status: "absent".to_string(),
            context_num: -1,
            head: "none".to_string(),
            commit_msg: String::new(),
            commit_time: 0,
            commits_30m: 0,
            working_no_commit: 0,
            tokens_today: 0,
            last_check: 0,
        }
    }
}

impl WindowSnapshot {
    /// Loads a snapshot, defaulting on missing or malformed content.
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn store(&self, path: &Path) -> io::Result<()> {
        let body = serde_json::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_scalar_atomic(path, &body)
    }
}
