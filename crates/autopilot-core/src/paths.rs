//! Filesystem layout for supervisor state.
//!
//! Everything the supervisor remembers lives under one base directory
//! (default `~/.autopilot`) so operators can inspect and mutate state with
//! ordinary file tools. Every path derived from a window name goes through
//! [`sanitize_window`] first.

use std::path::{Path, PathBuf};

/// Reduces a window name to a filesystem-safe key: `[A-Za-z0-9_-]`.
///
/// Any other byte becomes `-`. The original name is never interpolated into
/// a path.
pub fn sanitize_window(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolved locations of state files, locks and logs for one base directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    base: PathBuf,
}

impl StatePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Default base: `$AUTOPILOT_DIR`, falling back to `~/.autopilot`.
    pub fn default_base() -> PathBuf {
        if let Ok(dir) = std::env::var("AUTOPILOT_DIR") {
            return PathBuf::from(dir);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".autopilot")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.join("state")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("watchdog.log")
    }

    /// Creates the full directory layout. Safe to call repeatedly.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.state_dir(),
            self.activity_dir(),
            self.cooldown_dir(),
            self.commits_dir(),
            self.review_history_dir(),
            self.locks_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    // ── state/ ──

    pub fn snapshot(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("{}.json", sanitize_window(window)))
    }

    pub fn activity_dir(&self) -> PathBuf {
        self.state_dir().join("watchdog-activity")
    }

    /// Unix-seconds timestamp of the last tick the window was seen working.
    pub fn activity(&self, window: &str) -> PathBuf {
        self.activity_dir().join(sanitize_window(window))
    }

    /// Consecutive-idle probe counter.
    pub fn idle_probe(&self, window: &str) -> PathBuf {
        self.activity_dir()
            .join(format!("idle-probe-{}", sanitize_window(window)))
    }

    pub fn cooldown_dir(&self) -> PathBuf {
        self.state_dir().join("watchdog-cooldown")
    }

    /// Cooldown timestamp keyed by `<kind>-<window>` (the caller composes
    /// the key; the window component must already be sanitized).
    pub fn cooldown(&self, key: &str) -> PathBuf {
        self.cooldown_dir().join(key)
    }

    pub fn commits_dir(&self) -> PathBuf {
        self.state_dir().join("watchdog-commits")
    }

    pub fn commits_head(&self, window: &str) -> PathBuf {
        self.commits_dir()
            .join(format!("{}-head", sanitize_window(window)))
    }

    pub fn since_review(&self, window: &str) -> PathBuf {
        self.commits_dir()
            .join(format!("{}-since-review", sanitize_window(window)))
    }

    pub fn last_review_commit(&self, window: &str) -> PathBuf {
        self.commits_dir()
            .join(format!("{}-last-review", sanitize_window(window)))
    }

    pub fn last_review_ts(&self, window: &str) -> PathBuf {
        self.commits_dir()
            .join(format!("{}-last-review-ts", sanitize_window(window)))
    }

    // ── flag files ──

    pub fn manual_task(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("manual-task-{}", sanitize_window(window)))
    }

    pub fn post_compact(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("post-compact-{}", sanitize_window(window)))
    }

    pub fn pre_compact_snapshot(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("pre-compact-snapshot-{}", sanitize_window(window)))
    }

    pub fn was_low_context(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("was-low-context-{}", sanitize_window(window)))
    }

    pub fn compact_sent(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("compact-sent-{}", sanitize_window(window)))
    }

    pub fn compact_failures(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("compact-failures-{}", sanitize_window(window)))
    }

    pub fn autocheck_issues(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("autocheck-issues-{}", sanitize_window(window)))
    }

    pub fn autocheck_hash(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("autocheck-hash-{}", sanitize_window(window)))
    }

    pub fn prd_issues(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("prd-issues-{}", sanitize_window(window)))
    }

    pub fn test_fail(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("test-fail-{}", sanitize_window(window)))
    }

    pub fn review_trigger(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("review-trigger-{}", sanitize_window(window)))
    }

    pub fn review_in_progress(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("review-in-progress-{}", sanitize_window(window)))
    }

    pub fn layer2_review(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("layer2-review-{}.txt", sanitize_window(window)))
    }

    pub fn review_history_dir(&self) -> PathBuf {
        self.state_dir().join("review-history")
    }

    pub fn alert_stalled(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("alert-stalled-{}", sanitize_window(window)))
    }

    pub fn nudge_attempts(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("nudge-attempts-{}", sanitize_window(window)))
    }

    /// Text of the last nudge sent, replayed into the pre-compact snapshot.
    pub fn last_nudge(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("last-nudge-{}", sanitize_window(window)))
    }

    pub fn todo_hash(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("todo-hash-{}", sanitize_window(window)))
    }

    /// Working-stall tracking record: `head=<hash>` / `context=<pct>` /
    /// `since=<unix>` lines.
    pub fn stall_track(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("stall-track-{}", sanitize_window(window)))
    }

    pub fn alert_working_stall(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("alert-working-stall-{}", sanitize_window(window)))
    }

    pub fn alert_manual_block(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("alert-manual-block-{}", sanitize_window(window)))
    }

    pub fn alert_low_context_critical(&self, window: &str) -> PathBuf {
        self.state_dir()
            .join(format!("alert-low-context-{}", sanitize_window(window)))
    }

    // ── locks/ ──

    pub fn global_lock(&self) -> PathBuf {
        self.locks_dir().join("watchdog-main.lock.d")
    }

    pub fn window_lock(&self, window: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("{}.lock.d", sanitize_window(window)))
    }

    pub fn send_lock(&self, window: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("tmux-send-{}.lock.d", sanitize_window(window)))
    }

    pub fn ack_lock(&self, window: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("ack-{}.lock.d", sanitize_window(window)))
    }

    pub fn autocheck_lock(&self, window: &str) -> PathBuf {
        self.locks_dir()
            .join(format!("autocheck-{}.lock.d", sanitize_window(window)))
    }

    pub fn consumer_lock(&self) -> PathBuf {
        self.locks_dir().join("consume-review-trigger.lock.d")
    }

    /// Counts live ack-check lock directories, the process-wide bound on
    /// concurrent ack checkers.
    pub fn ack_lock_count(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(self.locks_dir()) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with("ack-") && n.ends_with(".lock.d"))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_passthrough() {
        assert_eq!(sanitize_window("my-project_2"), "my-project_2");
    }

    #[test]
    fn test_sanitize_replaces_specials() {
        assert_eq!(sanitize_window("api server"), "api-server");
        assert_eq!(sanitize_window("../etc/passwd"), "---etc-passwd");
        assert_eq!(sanitize_window("proj:0"), "proj-0");
    }

    #[test]
    fn test_window_paths_use_sanitized_key() {
        let paths = StatePaths::new("/tmp/ap");
        let p = paths.snapshot("web ui");
        assert!(p.ends_with("state/web-ui.json"), "got {}", p.display());
        let l = paths.send_lock("web ui");
        assert!(
            l.ends_with("locks/tmux-send-web-ui.lock.d"),
            "got {}",
            l.display()
        );
    }

    #[test]
    fn test_ensure_layout_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(tmp.path().join("ap"));
        paths.ensure_layout().unwrap();
        assert!(paths.cooldown_dir().is_dir());
        assert!(paths.locks_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }

    #[test]
    fn test_ack_lock_count() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(tmp.path());
        paths.ensure_layout().unwrap();
        std::fs::create_dir(paths.ack_lock("a")).unwrap();
        std::fs::create_dir(paths.ack_lock("b")).unwrap();
        std::fs::create_dir(paths.send_lock("a")).unwrap();
        assert_eq!(paths.ack_lock_count(), 2);
    }
}
