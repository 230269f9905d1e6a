//! Line-oriented task queue, one file per project.
//!
//! Markers: `[ ]` pending, `[→]` in progress, `[x]` done, `[!]` blocked.
//! Lines beginning with `#` are comments. The supervisor only ever calls
//! the four helpers (next, start, done, count) and rewrites the file
//! atomically.

use crate::state_store;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct TaskQueue {
    path: PathBuf,
}

/// One queue item with its line index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub text: String,
    line: usize,
}

fn marker_of(line: &str) -> Option<(&'static str, &str)> {
    let trimmed = line.trim_start();
    for marker in ["[ ]", "[→]", "[x]", "[!]"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let tag = match marker {
                "[ ]" => "pending",
                "[→]" => "in_progress",
                "[x]" => "done",
                _ => "blocked",
            };
            return Some((tag, rest.trim()));
        }
    }
    None
}

impl TaskQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional queue location inside a project working tree.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(".autopilot").join("queue.md"))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn store(&self, lines: &[String]) -> io::Result<()> {
        state_store::write_scalar_atomic(&self.path, &lines.join("\n"))
    }

    /// First pending item, if any.
    pub fn next(&self) -> Option<QueueItem> {
        self.lines().iter().enumerate().find_map(|(i, l)| {
            marker_of(l).and_then(|(tag, text)| {
                (tag == "pending").then(|| QueueItem {
                    text: text.to_string(),
                    line: i,
                })
            })
        })
    }

    /// Current in-progress item, if any.
    pub fn in_progress(&self) -> Option<QueueItem> {
        self.lines().iter().enumerate().find_map(|(i, l)| {
            marker_of(l).and_then(|(tag, text)| {
                (tag == "in_progress").then(|| QueueItem {
                    text: text.to_string(),
                    line: i,
                })
            })
        })
    }

    /// Marks the first pending item in progress. Returns it.
    pub fn start(&self) -> io::Result<Option<QueueItem>> {
        let mut lines = self.lines();
        let Some(item) = self.next() else {
            return Ok(None);
        };
        lines[item.line] = lines[item.line].replacen("[ ]", "[→]", 1);
        self.store(&lines)?;
        Ok(Some(item))
    }

    /// Marks the in-progress item done, stamping the commit short-hash.
    pub fn done(&self, hash: &str) -> io::Result<Option<QueueItem>> {
        let mut lines = self.lines();
        let Some(item) = self.in_progress() else {
            return Ok(None);
        };
        lines[item.line] = format!(
            "{} ({hash})",
            lines[item.line].replacen("[→]", "[x]", 1).trim_end()
        );
        self.store(&lines)?;
        Ok(Some(item))
    }

    /// Number of pending items.
    pub fn count(&self) -> usize {
        self.lines()
            .iter()
            .filter(|l| marker_of(l).is_some_and(|(tag, _)| tag == "pending"))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue_with(content: &str) -> (TempDir, TaskQueue) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.md");
        std::fs::write(&path, content).unwrap();
        (tmp, TaskQueue::new(path))
    }

    #[test]
    fn test_next_skips_done_and_comments() {
        let (_tmp, q) = queue_with("# queue\n[x] shipped (abc1234)\n[ ] add login\n[ ] add logout\n");
        assert_eq!(q.next().unwrap().text, "add login");
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn test_start_marks_in_progress() {
        let (_tmp, q) = queue_with("[ ] add login\n[ ] add logout\n");
        let started = q.start().unwrap().unwrap();
        assert_eq!(started.text, "add login");
        assert_eq!(q.in_progress().unwrap().text, "add login");
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_done_stamps_hash() {
        let (_tmp, q) = queue_with("[→] add login\n[ ] add logout\n");
        let finished = q.done("abc1234").unwrap().unwrap();
        assert_eq!(finished.text, "add login");
        let content = std::fs::read_to_string(q.path.clone()).unwrap();
        assert!(content.contains("[x] add login (abc1234)"));
        assert!(q.in_progress().is_none());
    }

    #[test]
    fn test_done_without_in_progress_is_noop() {
        let (_tmp, q) = queue_with("[ ] add login\n");
        assert!(q.done("abc1234").unwrap().is_none());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let q = TaskQueue::new(tmp.path().join("missing.md"));
        assert!(q.next().is_none());
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn test_blocked_items_not_scheduled() {
        let (_tmp, q) = queue_with("[!] blocked on keys\n[ ] real work\n");
        assert_eq!(q.next().unwrap().text, "real work");
    }
}
