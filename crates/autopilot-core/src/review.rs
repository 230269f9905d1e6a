//! Incremental review pipeline.
//!
//! Two cooperating halves share the state store: the emitter inside the
//! supervisor (commit detection, Layer-1 checks, trigger files) and a
//! consumer that feeds accumulated commit ranges to the assistant itself
//! as a Layer-2 review, two-phase: send the instruction with a sink path,
//! return, and parse the sink on a later run. The since-review counter and
//! last-review cursor advance only when an output was actually produced
//! and parsed.

use crate::classifier::Classifier;
use crate::config::ReviewConfig;
use crate::exec;
use crate::git::{self, GitError};
use crate::injector::{InjectError, Injector};
use crate::lockfile;
use crate::notify::Notifier;
use crate::paths::StatePaths;
use crate::queue::TaskQueue;
use crate::state_store;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Freshness window of the `review-in-progress` flag.
const IN_PROGRESS_FRESH: u64 = 600;
/// Layer-1 debounce.
const AUTOCHECK_COOLDOWN: u64 = 120;
/// Fallback range bound when no last-review cursor exists.
const FALLBACK_RANGE_DEPTH: u32 = 20;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Trigger payload, `review-trigger-<window>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTrigger {
    pub project_dir: PathBuf,
    pub window: String,
}

/// Atomically writes a trigger authorizing one review. The since-review
/// counter is deliberately not touched here; it resets only on consumer
/// success.
pub fn write_trigger(
    paths: &StatePaths,
    window: &str,
    project_dir: &Path,
) -> Result<(), ReviewError> {
    let trigger = ReviewTrigger {
        project_dir: project_dir.to_path_buf(),
        window: window.to_string(),
    };
    let body = serde_json::to_string(&trigger)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    state_store::write_scalar_atomic(&paths.review_trigger(window), &body)?;
    tracing::info!(window, "review trigger written");
    Ok(())
}

/// Whether the write-review-trigger preconditions hold for a window.
pub fn review_due(paths: &StatePaths, window: &str, cfg: &ReviewConfig) -> bool {
    // At most one review in flight per project.
    if state_store::file_age_seconds(&paths.review_in_progress(window))
        .is_some_and(|age| age < IN_PROGRESS_FRESH)
    {
        return false;
    }
    if paths.review_trigger(window).exists() {
        return false;
    }
    let since = state_store::read_u64(&paths.since_review(window));
    if since >= cfg.commit_threshold {
        return true;
    }
    let last_ts = state_store::read_u64(&paths.last_review_ts(window));
    since > 0
        && last_ts > 0
        && state_store::now_unix().saturating_sub(last_ts) >= cfg.max_age_secs
}

/// Result of one commit-detection pass.
#[derive(Debug, Clone)]
pub struct CommitUpdate {
    pub new_head: String,
    pub new_commits: u64,
    pub subject: String,
    pub commit_time: u64,
}

/// Detects a HEAD change for one project and updates all derived state:
/// head marker, since-review counter, nudge backoff reset, stall-alert
/// clear, activity stamp, and queue completion.
pub async fn detect_commits(
    paths: &StatePaths,
    window: &str,
    project_dir: &Path,
) -> Result<Option<CommitUpdate>, ReviewError> {
    let Some(head) = git::head(project_dir).await? else {
        return Ok(None);
    };
    let stored = state_store::read_scalar(&paths.commits_head(window));

    if stored.as_deref() == Some(head.as_str()) {
        return Ok(None);
    }

    state_store::write_scalar_atomic(&paths.commits_head(window), &head)?;
    // A baseline for the review-age clause on first observation.
    if state_store::read_u64(&paths.last_review_ts(window)) == 0 {
        let _ = state_store::write_u64_atomic(&paths.last_review_ts(window), state_store::now_unix());
    }

    let Some(old) = stored else {
        // First observation of this repository: baseline only.
        tracing::info!(window, head = git::short(&head), "head baseline recorded");
        return Ok(None);
    };

    let new_commits = git::rev_list_count(project_dir, &old, &head).await.unwrap_or(1);
    let since = state_store::read_u64(&paths.since_review(window)) + new_commits;
    state_store::write_u64_atomic(&paths.since_review(window), since)?;

    // A commit is the strongest ack there is.
    state_store::remove(&paths.nudge_attempts(window));
    state_store::remove(&paths.alert_stalled(window));
    state_store::touch(&paths.activity(window))?;

    let subject = git::head_subject(project_dir).await.unwrap_or_default();
    let commit_time = git::head_commit_time(project_dir).await.unwrap_or(0);

    // Close out the queue item the assistant was working on.
    let queue = TaskQueue::for_project(project_dir);
    if queue.in_progress().is_some() {
        if let Ok(Some(item)) = queue.done(git::short(&head)) {
            tracing::info!(window, task = %item.text, "queue item completed");
        }
    }

    tracing::info!(
        window,
        head = git::short(&head),
        new_commits,
        since_review = since,
        subject = %subject,
        "new commits detected"
    );

    Ok(Some(CommitUpdate {
        new_head: head,
        new_commits,
        subject,
        commit_time,
    }))
}

// ── Layer-1 automated checks ──

static SUSPICIOUS: &[(&str, &str)] = &[
    ("eval(", "eval( call"),
    ("password=\"", "hardcoded password"),
    ("api_key=\"", "hardcoded api key"),
    ("secret=\"", "hardcoded secret"),
];

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "py", "rs", "sh", "go"];

fn is_source_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Scans tracked source files for suspicious patterns. Returns findings.
async fn scan_suspicious(project_dir: &Path) -> Vec<String> {
    let Some(out) = exec::run_ok("git", &["ls-files"], Some(project_dir), Duration::from_secs(10)).await
    else {
        return Vec::new();
    };
    let mut findings = Vec::new();
    for file in out.stdout.lines().filter(|f| is_source_file(f)) {
        let path = project_dir.join(file);
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if meta.len() > 1_000_000 {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (needle, label) in SUSPICIOUS {
            if content.contains(needle) {
                findings.push(format!("{label} in {file}"));
                break;
            }
        }
        if findings.len() >= 5 {
            break;
        }
    }
    findings
}

/// Layer-1 checks after a commit: pattern scan, optional type check,
/// tests for `fix:` commits. Debounced, lock-serialized per project, and
/// findings are deduplicated by content hash so an unchanged result is
/// not re-emitted.
pub async fn layer1_checks(
    paths: &StatePaths,
    window: &str,
    project_dir: &Path,
    commit_subject: &str,
) {
    let cooldown = paths.cooldown(&format!(
        "autocheck-{}",
        crate::paths::sanitize_window(window)
    ));
    let last = state_store::read_u64(&cooldown);
    if state_store::now_unix().saturating_sub(last) <= AUTOCHECK_COOLDOWN && last > 0 {
        tracing::debug!(window, "layer1 debounced");
        return;
    }

    let lock_path = paths.autocheck_lock(window);
    let lock = match lockfile::try_acquire(&lock_path, Duration::from_secs(300)) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::debug!(window, "layer1 locked, skipping");
            return;
        }
        Err(e) => {
            tracing::warn!(window, error = %e, "layer1 lock error");
            return;
        }
    };
    let _ = state_store::write_u64_atomic(&cooldown, state_store::now_unix());

    let mut findings = scan_suspicious(project_dir).await;

    // Type check when the project declares one.
    if project_dir.join("tsconfig.json").exists() {
        match exec::run(
            "tsc",
            &["--noEmit"],
            Some(project_dir),
            Duration::from_secs(30),
        )
        .await
        {
            Ok(_) => {}
            Err(exec::ExecError::Timeout { secs, .. }) => {
                findings.push(format!("tsc: timeout({secs}s)"));
            }
            Err(exec::ExecError::Failed { stderr, .. }) => {
                findings.push(format!("tsc: {stderr}"));
            }
            Err(exec::ExecError::Spawn { .. }) => {}
        }
    }

    // A fix commit gets its tests run.
    if git::commit_type(commit_subject) == Some("fix") && project_dir.join("package.json").exists()
    {
        match exec::run(
            "npm",
            &["test", "--silent"],
            Some(project_dir),
            Duration::from_secs(60),
        )
        .await
        {
            Ok(_) => state_store::remove(&paths.test_fail(window)),
            Err(e) => {
                let _ = state_store::touch(&paths.test_fail(window));
                findings.push(format!("tests failing after fix commit: {e}"));
            }
        }
    }

    let summary = findings.join("; ");
    let hash = format!("{:x}", Sha256::digest(summary.as_bytes()));
    let prev_hash = state_store::read_scalar(&paths.autocheck_hash(window)).unwrap_or_default();
    if hash == prev_hash {
        tracing::debug!(window, "layer1 findings unchanged");
        drop(lock);
        return;
    }
    let _ = state_store::write_scalar_atomic(&paths.autocheck_hash(window), &hash);
    if summary.is_empty() {
        state_store::remove(&paths.autocheck_issues(window));
        tracing::info!(window, "layer1 clean");
    } else {
        let _ = state_store::write_scalar_atomic(&paths.autocheck_issues(window), &summary);
        tracing::warn!(window, findings = %summary, "layer1 findings");
    }
    drop(lock);
}

/// Invokes the external PRD verification engine with the changed file
/// list; records a one-line failure summary for the rule engine.
pub async fn prd_verify(
    paths: &StatePaths,
    window: &str,
    project_dir: &Path,
    changed_files: &[String],
    engine: Option<&str>,
) {
    let Some(engine) = engine.filter(|e| !e.is_empty()) else {
        return;
    };
    let output_path = paths
        .state_dir()
        .join(format!("prd-verify-{}.out", crate::paths::sanitize_window(window)));
    let files = changed_files.join(",");
    let dir = project_dir.to_string_lossy();
    let out_str = output_path.to_string_lossy();
    match exec::run(
        engine,
        &["--project-dir", &dir, "--changed", &files, "--output", &out_str],
        None,
        Duration::from_secs(120),
    )
    .await
    {
        Ok(_) => state_store::remove(&paths.prd_issues(window)),
        Err(e) => {
            let summary = std::fs::read_to_string(&output_path)
                .ok()
                .and_then(|s| s.lines().next().map(str::to_string))
                .unwrap_or_else(|| e.to_string());
            let _ = state_store::write_scalar_atomic(&paths.prd_issues(window), &summary);
            tracing::warn!(window, summary = %summary, "prd verify failed");
        }
    }
}

// ── Consumer ──

/// Outcome of parsing one Layer-2 output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Clean,
    Issues(String),
}

/// Parses reviewer output: trimmed, case-insensitive `CLEAN` means clean;
/// anything else is an issues report. Partial matches do not count.
pub fn parse_review_output(content: &str) -> ReviewOutcome {
    let trimmed = content.trim();
    if trimmed.eq_ignore_ascii_case("clean") {
        ReviewOutcome::Clean
    } else {
        ReviewOutcome::Issues(preview_line(trimmed, 200))
    }
}

fn preview_line(text: &str, max: usize) -> String {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut out: String = first.chars().take(max).collect();
    if first.chars().count() > max {
        out.push('…');
    }
    out
}

/// Composes the Layer-2 instruction. The preview is capped; the reviewer's
/// scope is the full range.
pub fn compose_instruction(range: &str, files: &[String], preview_cap: usize, sink: &Path) -> String {
    let preview: Vec<&str> = files.iter().take(preview_cap).map(String::as_str).collect();
    let more = files.len().saturating_sub(preview.len());
    let mut file_list = preview.join(", ");
    if more > 0 {
        file_list.push_str(&format!(" (+{more} more)"));
    }
    format!(
        "Perform an incremental code review of `{range}` ({count} files changed: {file_list}). \
         Review the full diff, not only the listed files. Look for bugs, regressions and risky \
         patterns. When done, write your findings to {sink}. If there is nothing to report, \
         write exactly CLEAN to that file.",
        count = files.len(),
        sink = sink.display(),
    )
}

/// The trigger consumer. Safe under concurrent invocation: a consumer
/// lock serializes instances, and the mv-to-`.done`-then-rm dance prevents
/// double consumption.
pub struct ReviewConsumer<'a> {
    pub paths: &'a StatePaths,
    pub cfg: &'a ReviewConfig,
    pub classifier: &'a Classifier,
    pub injector: &'a Injector,
    pub notifier: &'a dyn Notifier,
}

impl ReviewConsumer<'_> {
    /// One consumer pass over all pending triggers. Returns how many
    /// reached `done`.
    pub async fn run_once(&self) -> Result<usize, ReviewError> {
        let lock_path = self.paths.consumer_lock();
        let Some(_lock) = lockfile::try_acquire(&lock_path, Duration::from_secs(60))? else {
            tracing::debug!("consumer already running, skipping");
            return Ok(0);
        };

        let mut consumed = 0;
        for trigger_path in self.pending_triggers() {
            let Some(body) = state_store::read_scalar(&trigger_path) else {
                continue;
            };
            let Ok(trigger) = serde_json::from_str::<ReviewTrigger>(&body) else {
                tracing::warn!(path = %trigger_path.display(), "malformed trigger, removing");
                state_store::remove(&trigger_path);
                continue;
            };
            if self.process(&trigger, &trigger_path).await? {
                consumed += 1;
            }
        }
        Ok(consumed)
    }

    fn pending_triggers(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.paths.state_dir()) else {
            return Vec::new();
        };
        let mut triggers: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("review-trigger-") && !n.ends_with(".done"))
            })
            .collect();
        triggers.sort();
        triggers
    }

    /// Drives one trigger through its state machine. Returns true when the
    /// trigger reached `done` this pass.
    async fn process(&self, trigger: &ReviewTrigger, trigger_path: &Path) -> Result<bool, ReviewError> {
        let window = &trigger.window;
        let stale = state_store::file_age_seconds(trigger_path)
            .is_some_and(|age| age >= self.cfg.stale_trigger_secs);

        let in_progress = self.paths.review_in_progress(window);
        let in_progress_fresh = state_store::file_age_seconds(&in_progress)
            .is_some_and(|age| age < IN_PROGRESS_FRESH);

        if in_progress_fresh {
            let sink = self.paths.layer2_review(window);
            let content = std::fs::read_to_string(&sink).unwrap_or_default();
            if content.trim().is_empty() {
                tracing::debug!(window, "awaiting review output");
                return Ok(false);
            }
            self.finish(trigger, trigger_path, &content).await?;
            return Ok(true);
        }

        // Deferred: the assistant is busy and the trigger is not yet stale.
        if !stale {
            let obs = self.classifier.observe(window).await;
            if !obs.status.is_idle() {
                tracing::info!(window, status = obs.status.as_str(), "trigger deferred");
                return Ok(false);
            }
        } else {
            tracing::warn!(window, "stale trigger, force-consuming");
        }

        // In-progress flag exists but expired: check for late output first.
        if in_progress.exists() {
            let sink = self.paths.layer2_review(window);
            let content = std::fs::read_to_string(&sink).unwrap_or_default();
            if !content.trim().is_empty() {
                self.finish(trigger, trigger_path, &content).await?;
                return Ok(true);
            }
            state_store::remove(&in_progress);
        }

        self.send_instruction(trigger).await?;
        Ok(false)
    }

    /// Phase one: compose and inject the instruction, mark in-progress with
    /// the reviewed head as payload, and return without waiting.
    async fn send_instruction(&self, trigger: &ReviewTrigger) -> Result<(), ReviewError> {
        let window = &trigger.window;
        let Some(head) = git::head(&trigger.project_dir).await? else {
            tracing::warn!(window, "project has no commits, dropping trigger");
            state_store::remove(&self.paths.review_trigger(window));
            return Ok(());
        };

        let range = match state_store::read_scalar(&self.paths.last_review_commit(window)) {
            Some(last) if !last.is_empty() => format!("{last}..{head}"),
            _ => format!("HEAD~{FALLBACK_RANGE_DEPTH}..{head}"),
        };
        let files = git::changed_files(&trigger.project_dir, &range)
            .await
            .unwrap_or_default();

        let sink = self.paths.layer2_review(window);
        state_store::remove(&sink);
        let instruction = compose_instruction(&range, &files, self.cfg.file_preview_cap, &sink);

        self.injector.inject(window, &instruction).await?;
        // Flag payload records which head this review covers.
        state_store::write_scalar_atomic(&self.paths.review_in_progress(window), &head)?;
        tracing::info!(window, range = %range, files = files.len(), "layer2 sent");
        Ok(())
    }

    /// Phase two: parse the sink, advance cursors, consume the trigger.
    async fn finish(
        &self,
        trigger: &ReviewTrigger,
        trigger_path: &Path,
        content: &str,
    ) -> Result<(), ReviewError> {
        let window = &trigger.window;
        let reviewed_head = state_store::read_scalar(&self.paths.review_in_progress(window))
            .filter(|h| !h.is_empty());
        let outcome = parse_review_output(content);

        match &outcome {
            ReviewOutcome::Clean => {
                tracing::info!(window, "review_clean");
                state_store::remove(&self.paths.autocheck_issues(window));
                state_store::remove(&self.paths.nudge_attempts(window));
                state_store::remove(&self.paths.alert_stalled(window));
            }
            ReviewOutcome::Issues(preview) => {
                tracing::warn!(window, preview = %preview, "review found issues");
                let _ =
                    state_store::write_scalar_atomic(&self.paths.autocheck_issues(window), preview);
                self.notifier
                    .notify(&format!("🔍 autopilot | {window}\n\nreview issues: {preview}"));
            }
        }

        // Cursor and counter advance exactly once per trigger lifetime.
        state_store::write_u64_atomic(&self.paths.since_review(window), 0)?;
        state_store::write_u64_atomic(&self.paths.last_review_ts(window), state_store::now_unix())?;
        if let Some(head) = reviewed_head {
            state_store::write_scalar_atomic(&self.paths.last_review_commit(window), &head)?;
        }
        state_store::remove(&self.paths.review_in_progress(window));

        // mv + rm prevents a double consume under concurrent invocation.
        let done_path = trigger_path.with_extension("done");
        std::fs::rename(trigger_path, &done_path)?;
        let _ = std::fs::remove_file(&done_path);

        self.append_history(window, content)?;
        Ok(())
    }

    fn append_history(&self, window: &str, content: &str) -> Result<(), ReviewError> {
        let dir = self.paths.review_history_dir();
        std::fs::create_dir_all(&dir)?;
        // HH-MM-SS suffix: never overwrite within a day.
        let stamp = chrono::Local::now().format("%Y%m%d-%H-%M-%S");
        let file = dir.join(format!(
            "{}-{stamp}.txt",
            crate::paths::sanitize_window(window)
        ));
        std::fs::write(file, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewConfig;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, StatePaths) {
        let tmp = TempDir::new().unwrap();
        let paths = StatePaths::new(tmp.path().join("ap"));
        paths.ensure_layout().unwrap();
        (tmp, paths)
    }

    #[test]
    fn test_parse_clean_case_insensitive() {
        assert_eq!(parse_review_output("CLEAN\n"), ReviewOutcome::Clean);
        assert_eq!(parse_review_output("  clean  "), ReviewOutcome::Clean);
        assert_eq!(parse_review_output("Clean"), ReviewOutcome::Clean);
    }

    #[test]
    fn test_parse_partial_clean_is_issues() {
        // "CLEAN except..." must not count as clean.
        match parse_review_output("CLEAN except one thing") {
            ReviewOutcome::Issues(p) => assert!(p.contains("except")),
            other => panic!("expected issues, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_issues_previews_first_line() {
        let out = parse_review_output("\n\nbug in auth.rs line 10\nmore detail\n");
        assert_eq!(out, ReviewOutcome::Issues("bug in auth.rs line 10".to_string()));
    }

    #[test]
    fn test_compose_instruction_caps_preview_not_count() {
        let files: Vec<String> = (0..30).map(|i| format!("src/f{i}.rs")).collect();
        let sink = PathBuf::from("/tmp/out.txt");
        let text = compose_instruction("abc..def", &files, 20, &sink);
        assert!(text.contains("abc..def"));
        assert!(text.contains("30 files changed"));
        assert!(text.contains("(+10 more)"));
        assert!(text.contains("/tmp/out.txt"));
        assert!(text.contains("src/f19.rs"));
        assert!(!text.contains("src/f20.rs,"));
    }

    #[test]
    fn test_write_trigger_payload() {
        let (_tmp, paths) = fixture();
        write_trigger(&paths, "web", Path::new("/src/web")).unwrap();
        let body = state_store::read_scalar(&paths.review_trigger("web")).unwrap();
        let trigger: ReviewTrigger = serde_json::from_str(&body).unwrap();
        assert_eq!(trigger.window, "web");
        assert_eq!(trigger.project_dir, PathBuf::from("/src/web"));
    }

    #[test]
    fn test_review_due_commit_threshold() {
        let (_tmp, paths) = fixture();
        let cfg = ReviewConfig::default();
        assert!(!review_due(&paths, "web", &cfg));
        state_store::write_u64_atomic(&paths.since_review("web"), 15).unwrap();
        assert!(review_due(&paths, "web", &cfg));
    }

    #[test]
    fn test_review_due_age_clause() {
        let (_tmp, paths) = fixture();
        let cfg = ReviewConfig::default();
        state_store::write_u64_atomic(&paths.since_review("web"), 1).unwrap();
        // Recent review: not due.
        state_store::write_u64_atomic(&paths.last_review_ts("web"), state_store::now_unix())
            .unwrap();
        assert!(!review_due(&paths, "web", &cfg));
        // Old review: due.
        state_store::write_u64_atomic(
            &paths.last_review_ts("web"),
            state_store::now_unix() - 7300,
        )
        .unwrap();
        assert!(review_due(&paths, "web", &cfg));
    }

    #[test]
    fn test_review_due_suppressed_by_in_progress() {
        // While a review is in flight, no new one is issued.
        let (_tmp, paths) = fixture();
        let cfg = ReviewConfig::default();
        state_store::write_u64_atomic(&paths.since_review("web"), 20).unwrap();
        state_store::touch(&paths.review_in_progress("web")).unwrap();
        assert!(!review_due(&paths, "web", &cfg));
        state_store::remove(&paths.review_in_progress("web"));
        assert!(review_due(&paths, "web", &cfg));
    }

    #[test]
    fn test_review_due_suppressed_by_pending_trigger() {
        let (_tmp, paths) = fixture();
        let cfg = ReviewConfig::default();
        state_store::write_u64_atomic(&paths.since_review("web"), 20).unwrap();
        write_trigger(&paths, "web", Path::new("/src/web")).unwrap();
        assert!(!review_due(&paths, "web", &cfg));
    }

    #[tokio::test]
    async fn test_detect_commits_full_cycle() {
        use std::process::Command;
        let (tmp, paths) = fixture();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "t@t.local"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(&repo).output().unwrap();
        }
        let commit = |file: &str, msg: &str| {
            std::fs::write(repo.join(file), msg).unwrap();
            Command::new("git").args(["add", "-A"]).current_dir(&repo).output().unwrap();
            Command::new("git").args(["commit", "-m", msg]).current_dir(&repo).output().unwrap();
        };
        commit("a.rs", "feat: one");

        // First observation is a baseline, not a detection.
        let update = detect_commits(&paths, "web", &repo).await.unwrap();
        assert!(update.is_none());
        assert!(state_store::read_scalar(&paths.commits_head("web")).is_some());

        // Stalled state that a commit must clear.
        state_store::write_u64_atomic(&paths.nudge_attempts("web"), 6).unwrap();
        state_store::touch(&paths.alert_stalled("web")).unwrap();

        commit("b.rs", "feat: two");
        commit("c.rs", "fix: three");
        let update = detect_commits(&paths, "web", &repo).await.unwrap().unwrap();
        assert_eq!(update.new_commits, 2);
        assert_eq!(update.subject, "fix: three");
        assert_eq!(state_store::read_u64(&paths.since_review("web")), 2);
        assert!(!paths.nudge_attempts("web").exists());
        assert!(!paths.alert_stalled("web").exists());
        assert!(paths.activity("web").exists());

        // No change: no detection.
        assert!(detect_commits(&paths, "web", &repo).await.unwrap().is_none());
    }

    #[test]
    fn test_is_source_file() {
        assert!(is_source_file("src/a.ts"));
        assert!(is_source_file("b.rs"));
        assert!(!is_source_file("README.md"));
        assert!(!is_source_file("Cargo.lock"));
    }
}
