//! Nudge message composition: per-tick template variables, template
//! rendering and the pre-compact snapshot used to rebuild momentum after a
//! context compaction.

use crate::git;
use crate::paths::StatePaths;
use crate::queue::TaskQueue;
use crate::state_store;
use std::collections::HashMap;
use std::path::Path;

/// Default template for a plain idle nudge.
pub const DEFAULT_NUDGE_TEMPLATE: &str = "Continue working on the current task. \
Phase: {phase}. Remaining TODO items: {prd_remaining}. \
Last commit: {last_commit}.{issues_clause} \
If everything is done, review the TODO list and pick the next item.";

/// Default template for the post-compact recovery nudge.
pub const DEFAULT_RECOVERY_TEMPLATE: &str = "Context was just compacted. \
Here is where you were: {snapshot}. \
Re-read anything you need and continue with the task in progress.";

/// Per-tick bag of variables available to templates.
#[derive(Debug, Clone, Default)]
pub struct NudgeContext {
    /// Project phase (dev/review/test/deploy) from `status.json`.
    pub phase: String,
    /// Remaining unchecked TODO items.
    pub prd_remaining: usize,
    pub last_commit: String,
    pub commit_type: String,
    /// Consecutive `feat:` commits at the head of history.
    pub feat_streak: usize,
    /// One-line autocheck/prd issues, empty when clean.
    pub issues: String,
    /// Rendered pre-compact snapshot, empty when absent.
    pub snapshot: String,
    /// Next queue item, empty when the queue is idle.
    pub queue_item: String,
    pub window: String,
}

/// Counts unchecked `- [ ]` items in the project TODO list.
pub fn todo_remaining(project_dir: &Path) -> usize {
    let path = project_dir.join(".autopilot").join("todo.md");
    std::fs::read_to_string(path)
        .map(|s| s.lines().filter(|l| l.trim_start().starts_with("- [ ]")).count())
        .unwrap_or(0)
}

/// Raw TODO list content, for change hashing. Empty when missing.
pub fn todo_content(project_dir: &Path) -> String {
    std::fs::read_to_string(project_dir.join(".autopilot").join("todo.md")).unwrap_or_default()
}

/// Project phase from `<project>/status.json`, defaulting to `dev`.
fn project_phase(project_dir: &Path) -> String {
    std::fs::read_to_string(project_dir.join("status.json"))
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .and_then(|v| v.get("phase").and_then(|p| p.as_str()).map(str::to_string))
        .unwrap_or_else(|| "dev".to_string())
}

fn feat_streak(subjects: &[String]) -> usize {
    subjects
        .iter()
        .take_while(|s| git::commit_type(s) == Some("feat"))
        .count()
}

impl NudgeContext {
    /// Gathers the context for one window. `recent_subjects` is newest
    /// first, as `git log` emits it.
    pub fn gather(
        paths: &StatePaths,
        window: &str,
        project_dir: &Path,
        recent_subjects: &[String],
    ) -> Self {
        let last_commit = recent_subjects.first().cloned().unwrap_or_default();
        let commit_type = git::commit_type(&last_commit).unwrap_or("").to_string();

        let mut issues = Vec::new();
        if let Some(text) = state_store::read_scalar(&paths.autocheck_issues(window)) {
            if !text.is_empty() {
                issues.push(text);
            }
        }
        if let Some(text) = state_store::read_scalar(&paths.prd_issues(window)) {
            if !text.is_empty() {
                issues.push(text);
            }
        }

        let snapshot = PreCompactSnapshot::load(&paths.pre_compact_snapshot(window))
            .map(|s| s.render())
            .unwrap_or_default();

        let queue_item = TaskQueue::for_project(project_dir)
            .next()
            .map(|i| i.text)
            .unwrap_or_default();

        Self {
            phase: project_phase(project_dir),
            prd_remaining: todo_remaining(project_dir),
            last_commit,
            commit_type,
            feat_streak: feat_streak(recent_subjects),
            issues: issues.join("; "),
            snapshot,
            queue_item,
            window: window.to_string(),
        }
    }

    /// Expands `{key}` placeholders. Unknown placeholders are left intact.
    pub fn render(&self, template: &str) -> String {
        let issues_clause = if self.issues.is_empty() {
            String::new()
        } else {
            format!(" Known issues: {}.", self.issues)
        };
        let vars: HashMap<&str, String> = HashMap::from([
            ("phase", self.phase.clone()),
            ("prd_remaining", self.prd_remaining.to_string()),
            ("last_commit", self.last_commit.clone()),
            ("commit_type", self.commit_type.clone()),
            ("feat_streak", self.feat_streak.to_string()),
            ("issues", self.issues.clone()),
            ("issues_clause", issues_clause),
            ("snapshot", self.snapshot.clone()),
            ("queue_item", self.queue_item.clone()),
            ("window", self.window.clone()),
        ]);
        let mut out = template.to_string();
        for (key, value) in &vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

/// State captured right before sending `/compact`, replayed into the
/// recovery nudge once the assistant comes back with a fresh context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreCompactSnapshot {
    pub uncommitted: Vec<String>,
    pub recent_commits: Vec<String>,
    pub queue_item: Option<String>,
    pub last_nudge: Option<String>,
}

impl PreCompactSnapshot {
    /// Serializes as key=value lines; list values are `|`-joined.
    pub fn to_payload(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("uncommitted={}", self.uncommitted.join("|")));
        lines.push(format!("recent={}", self.recent_commits.join("|")));
        if let Some(item) = &self.queue_item {
            lines.push(format!("queue={item}"));
        }
        if let Some(nudge) = &self.last_nudge {
            lines.push(format!("last_nudge={nudge}"));
        }
        lines.join("\n")
    }

    pub fn from_payload(payload: &str) -> Self {
        let mut snap = Self::default();
        for line in payload.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "uncommitted" => {
                    snap.uncommitted = split_list(value);
                }
                "recent" => {
                    snap.recent_commits = split_list(value);
                }
                "queue" => snap.queue_item = Some(value.to_string()),
                "last_nudge" => snap.last_nudge = Some(value.to_string()),
                _ => {}
            }
        }
        snap
    }

    pub fn store(&self, path: &Path) -> std::io::Result<()> {
        state_store::write_scalar_atomic(path, &self.to_payload())
    }

    pub fn load(path: &Path) -> Option<Self> {
        state_store::read_scalar(path).map(|s| Self::from_payload(&s))
    }

    /// One-line human rendering for the recovery template.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.recent_commits.is_empty() {
            parts.push(format!("recent commits: {}", self.recent_commits.join(", ")));
        }
        if !self.uncommitted.is_empty() {
            parts.push(format!("uncommitted files: {}", self.uncommitted.join(", ")));
        }
        if let Some(item) = &self.queue_item {
            parts.push(format!("task in progress: {item}"));
        }
        if let Some(nudge) = &self.last_nudge {
            parts.push(format!("last instruction: {nudge}"));
        }
        parts.join("; ")
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
