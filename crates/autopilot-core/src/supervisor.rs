//! The supervisor loop: classify, detect commits, evaluate rules, act,
//! acknowledge: per project, on a fixed tick, until told to stop.
//!
//! The main decision path is a single cooperative task; ack checks and
//! Layer-1 scans run as spawned background tasks that coordinate with the
//! loop exclusively through the filesystem state store and lock
//! directories. Graceful shutdown terminates outstanding background tasks
//! before releasing the global lock; leaving injectors running without
//! the lock would break the single-writer invariant.

use crate::classifier::{Classifier, Observation, WindowStatus};
use crate::config::{AutopilotConfig, Project};
use crate::git;
use crate::injector::Injector;
use crate::lockfile::{self, GlobalLock, LockError};
use crate::notify::{self, Notifier};
use crate::nudge::{NudgeContext, PreCompactSnapshot};
use crate::paths::StatePaths;
use crate::patterns::PatternSet;
use crate::queue::TaskQueue;
use crate::review;
use crate::rules::{self, ActionKind, Decision, GuardCtx};
use crate::state_store::{self, WindowSnapshot};
use crate::tmux::Tmux;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Concurrent ack-checker cap, enforced by counting ack-lock directories.
const MAX_ACK_CHECKS: usize = 8;
/// Ack observation window.
const ACK_WINDOW: Duration = Duration::from_secs(60);
/// Warn after this long working with no head/context movement.
const WORKING_STALL_WARN: u64 = 15 * 60;
/// Alert (one-shot) after this long.
const WORKING_STALL_ALERT: u64 = 30 * 60;
/// Context still low this long after `/compact` counts as a failure.
const COMPACT_FAIL_AFTER: u64 = 180;
/// Rotation pass interval, in cycles (~50 min at a 10 s tick).
const ROTATE_EVERY_CYCLES: u64 = 300;
/// Main log line budget.
const LOG_LINE_BUDGET: usize = 20_000;
/// Sampled status-log interval.
const STATUS_LOG_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("missing required helper: {0}")]
    MissingHelper(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Supervisor {
    cfg: AutopilotConfig,
    paths: StatePaths,
    tmux: Tmux,
    classifier: Classifier,
    injector: Injector,
    notifier: Arc<dyn Notifier>,
    shutdown: Arc<AtomicBool>,
    background: Vec<JoinHandle<()>>,
    cycles: u64,
}

impl Supervisor {
    pub fn new(cfg: AutopilotConfig, notifier: Arc<dyn Notifier>) -> Self {
        let paths = StatePaths::new(&cfg.base_dir);
        let pats = PatternSet::with_overrides(&cfg.patterns);
        let tmux = Tmux::new(&cfg.tmux.bin, &cfg.tmux.session);
        let classifier = Classifier::new(tmux.clone(), pats.clone(), cfg.low_context_threshold);
        let injector = Injector::new(tmux.clone(), pats, paths.clone());
        Self {
            cfg,
            paths,
            tmux,
            classifier,
            injector,
            notifier,
            shutdown: Arc::new(AtomicBool::new(false)),
            background: Vec::new(),
            cycles: 0,
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Runs until shutdown. Fatal errors only at startup.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        self.paths.ensure_layout()?;
        let _global = GlobalLock::acquire(&self.paths.global_lock())?;

        self.preflight().await?;
        tracing::info!(
            source = self.cfg.projects_source.as_str(),
            count = self.cfg.projects.len(),
            "projects loaded"
        );

        self.startup_cleanup();
        self.install_signal_handlers();
        self.bootstrap_tmux().await;

        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick().await;
            self.cycles += 1;
            if self.cycles % ROTATE_EVERY_CYCLES == 0 {
                self.rotate_logs();
            }
            let sleep = tokio::time::sleep(Duration::from_secs(self.cfg.tick_secs));
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = sleep => {}
                _ = async {
                    while !shutdown.load(Ordering::Relaxed) {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                } => {}
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    async fn preflight(&self) -> Result<(), SupervisorError> {
        for bin in [self.cfg.tmux.bin.as_str(), "git"] {
            let found = crate::exec::run_ok(bin, &["-V"], None, Duration::from_secs(5))
                .await
                .is_some()
                || crate::exec::run_ok(bin, &["--version"], None, Duration::from_secs(5))
                    .await
                    .is_some();
            if !found {
                return Err(SupervisorError::MissingHelper(bin.to_string()));
            }
        }
        Ok(())
    }

    /// Drops state for windows no longer configured and ages out the
    /// cooldown/activity directories.
    fn startup_cleanup(&self) {
        let known: Vec<String> = self
            .cfg
            .projects
            .iter()
            .map(|p| crate::paths::sanitize_window(&p.window))
            .collect();
        if let Ok(entries) = std::fs::read_dir(self.paths.state_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(stem) = name.strip_suffix(".json") else {
                    continue;
                };
                if !known.iter().any(|w| w == stem) {
                    tracing::info!(window = stem, "dropping state of unconfigured window");
                    state_store::remove(&path);
                }
            }
        }
        let cooldown_gc = state_store::gc_older_than(&self.paths.cooldown_dir(), 1);
        let activity_gc = state_store::gc_older_than(&self.paths.activity_dir(), 1);
        if cooldown_gc + activity_gc > 0 {
            tracing::info!(cooldown_gc, activity_gc, "startup state gc");
        }
    }

    fn install_signal_handlers(&self) {
        let flag = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("SIGINT received, stopping");
            flag.store(true, Ordering::Relaxed);
        });
        #[cfg(unix)]
        {
            let flag = self.shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("SIGTERM received, stopping");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
                }
            });
        }
    }

    /// Ensures the session exists with one window per project. Windows
    /// with a live assistant are untouched; windows at a shell are left
    /// for the resume-shell rule.
    async fn bootstrap_tmux(&self) {
        let mut session_exists = self.tmux.has_session().await;
        let existing = if session_exists {
            self.tmux.list_windows().await.unwrap_or_default()
        } else {
            Vec::new()
        };
        for project in &self.cfg.projects {
            if existing.contains(&project.window) {
                continue;
            }
            let result = if session_exists {
                self.tmux.new_window(&project.window, &project.dir).await
            } else {
                let r = self.tmux.new_session(&project.window, &project.dir).await;
                session_exists = r.is_ok();
                r
            };
            match result {
                Ok(()) => {
                    let launch = format!(
                        "cd {} && {}",
                        project.dir.display(),
                        self.cfg.assistant.command
                    );
                    let _ = self.tmux.send_literal(&project.window, &launch).await;
                    let _ = self.tmux.send_key(&project.window, "Enter").await;
                    tracing::info!(window = %project.window, "created tmux window");
                }
                Err(e) => {
                    tracing::warn!(window = %project.window, error = %e, "tmux bootstrap failed");
                }
            }
        }
    }

    async fn tick(&mut self) {
        self.background.retain(|h| !h.is_finished());
        let projects = self.cfg.projects.clone();
        for project in &projects {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.tick_project(project).await;
        }
    }

    async fn tick_project(&mut self, project: &Project) {
        let window = project.window.as_str();
        let obs = self.classifier.observe(window).await;

        self.maybe_log_status(window, &obs);
        self.surface_alerts(window, &obs);
        self.track_compaction(window, &obs).await;

        match review::detect_commits(&self.paths, window, &project.dir).await {
            Ok(Some(update)) => {
                self.on_new_commits(project, &update).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(window, error = %e, "commit detection failed"),
        }

        self.detect_todo_change(project);

        if obs.status == WindowStatus::Working {
            let _ = state_store::write_u64_atomic(&self.paths.activity(window), state_store::now_unix());
            state_store::remove(&self.paths.idle_probe(window));
            self.track_working_stall(window, &obs);
        } else {
            state_store::remove(&self.paths.stall_track(window));
            state_store::remove(&self.paths.alert_working_stall(window));
        }

        let decision = self.evaluate_rules(project, &obs);
        if let Some(decision) = decision {
            self.execute(project, &obs, &decision).await;
        }

        self.write_snapshot(window, project, &obs).await;
    }

    fn evaluate_rules(&self, project: &Project, obs: &Observation) -> Option<Decision> {
        let window = project.window.as_str();
        let activity = state_store::read_u64(&self.paths.activity(window));
        let activity_age = (activity > 0).then(|| state_store::now_unix().saturating_sub(activity));
        let has_autocheck_issues = self.paths.autocheck_issues(window).exists();
        let has_prd_issues = self.paths.prd_issues(window).exists();
        let review_clean =
            state_store::read_u64(&self.paths.last_review_ts(window)) > 0 && !has_autocheck_issues;
        let ctx = GuardCtx {
            paths: &self.paths,
            window,
            obs,
            now: state_store::now_unix(),
            activity_age,
            todo_remaining: crate::nudge::todo_remaining(&project.dir),
            has_autocheck_issues,
            has_prd_issues,
            review_clean,
            queue_has_next: TaskQueue::for_project(&project.dir).next().is_some(),
            review_due: review::review_due(&self.paths, window, &self.cfg.review),
            post_compact: self.paths.post_compact(window).exists(),
            notifier: &*self.notifier,
        };
        self.cfg.rules.evaluate(&ctx)
    }

    async fn execute(&mut self, project: &Project, obs: &Observation, decision: &Decision) {
        let window = project.window.as_str();
        match decision.action {
            ActionKind::Observe => {}
            ActionKind::ApprovePermission => self.approve_permission(window).await,
            ActionKind::SendNudge => self.send_nudge(project, obs, decision).await,
            ActionKind::SendCompact => self.send_compact(project).await,
            ActionKind::ResumeShell => self.resume_shell(project).await,
            ActionKind::WriteReviewTrigger => {
                match review::write_trigger(&self.paths, window, &project.dir) {
                    Ok(()) => self.set_cooldown(window, "review"),
                    Err(e) => tracing::warn!(window, error = %e, "trigger write failed"),
                }
            }
        }
    }

    fn set_cooldown(&self, window: &str, key: &str) {
        let file = self
            .paths
            .cooldown(&format!("{key}-{}", crate::paths::sanitize_window(window)));
        let _ = state_store::write_u64_atomic(&file, state_store::now_unix());
    }

    async fn approve_permission(&self, window: &str) {
        // The dialog may have resolved since classification; confirm on a
        // fresh capture before pressing anything.
        let pane = self
            .tmux
            .capture_pane(window, crate::classifier::CAPTURE_LINES)
            .await
            .unwrap_or_default();
        let fresh = crate::classifier::classify_pane(
            &pane,
            self.classifier.patterns(),
            self.cfg.low_context_threshold,
        );
        if !fresh.status.is_permission() {
            tracing::info!(window, "permission dialog gone, not pressing");
            return;
        }
        match self.injector.press(window, "p").await {
            Ok(()) => {
                self.set_cooldown(window, "permission");
                tracing::info!(window, action = "approve-permission", "permission granted");
            }
            Err(e) => tracing::warn!(window, error = %e, "permission approval failed"),
        }
    }

    async fn send_nudge(&mut self, project: &Project, obs: &Observation, decision: &Decision) {
        let window = project.window.as_str();
        let subjects = git::recent_subjects(&project.dir, 5).await.unwrap_or_default();
        let ctx = NudgeContext::gather(&self.paths, window, &project.dir, &subjects);

        let template = match (&decision.template, &project.default_nudge) {
            (Some(name), Some(custom)) if name == "nudge" => custom.as_str(),
            (Some(name), _) => self.cfg.template(name),
            (None, Some(custom)) => custom.as_str(),
            (None, None) => self.cfg.template("nudge"),
        };
        let message = ctx.render(template);

        let pre_head = state_store::read_scalar(&self.paths.commits_head(window));
        let pre_context = obs.context_num;
        let was_post_compact = self.paths.post_compact(window).exists();

        match self.injector.inject(window, &message).await {
            Ok(()) => {
                self.set_cooldown(window, "nudge");
                let attempts = state_store::read_u64(&self.paths.nudge_attempts(window)) + 1;
                let _ = state_store::write_u64_atomic(&self.paths.nudge_attempts(window), attempts);
                rules::record_daily_send(&self.paths, window);
                let _ = state_store::write_scalar_atomic(&self.paths.last_nudge(window), &message);
                if was_post_compact {
                    // Recovery delivered: both one-shot flags are consumed.
                    state_store::remove(&self.paths.post_compact(window));
                    state_store::remove(&self.paths.was_low_context(window));
                    state_store::remove(&self.paths.pre_compact_snapshot(window));
                }
                tracing::info!(window, rule = %decision.rule, attempts, "nudge sent");
                self.spawn_ack_check(project, pre_head, obs.status, pre_context);
            }
            Err(e) => {
                // Failed sends are not credited to the backoff budget: no
                // cooldown, no attempt increment.
                let pane_tail: String = obs
                    .last_activity
                    .clone()
                    .unwrap_or_default()
                    .chars()
                    .take(60)
                    .collect();
                tracing::warn!(window, error = %e, pane = %pane_tail, "nudge send failed");
            }
        }
    }

    async fn send_compact(&mut self, project: &Project) {
        let window = project.window.as_str();
        let uncommitted = git::uncommitted_files(&project.dir).await.unwrap_or_default();
        let recent = git::recent_subjects(&project.dir, 3).await.unwrap_or_default();
        let snapshot = PreCompactSnapshot {
            uncommitted,
            recent_commits: recent,
            queue_item: TaskQueue::for_project(&project.dir)
                .in_progress()
                .map(|i| i.text),
            last_nudge: state_store::read_scalar(&self.paths.last_nudge(window)),
        };
        if let Err(e) = snapshot.store(&self.paths.pre_compact_snapshot(window)) {
            tracing::warn!(window, error = %e, "pre-compact snapshot write failed");
        }

        match self.injector.inject(window, "/compact").await {
            Ok(()) => {
                let _ = state_store::touch(&self.paths.compact_sent(window));
                let _ = state_store::touch(&self.paths.was_low_context(window));
                self.set_cooldown(window, "compact");
                tracing::info!(window, "compact sent");
            }
            Err(e) => tracing::warn!(window, error = %e, "compact send failed"),
        }
    }

    async fn resume_shell(&self, project: &Project) {
        let window = project.window.as_str();
        // The one deliberate shell write: relaunching the assistant after
        // an exit. The injector would refuse this pane, so it goes through
        // tmux directly.
        let launch = format!(
            "cd {} && {}",
            project.dir.display(),
            self.cfg.assistant.command
        );
        let sent = self.tmux.send_literal(window, &launch).await;
        let entered = self.tmux.send_key(window, "Enter").await;
        match sent.and(entered) {
            Ok(()) => {
                self.set_cooldown(window, "shell");
                tracing::info!(window, "assistant relaunched");
            }
            Err(e) => tracing::warn!(window, error = %e, "relaunch failed"),
        }
    }

    /// Background ack check after a nudge: did the assistant visibly react
    /// within the window (new commit, working state, context change)?
    fn spawn_ack_check(
        &mut self,
        project: &Project,
        pre_head: Option<String>,
        pre_status: WindowStatus,
        pre_context: i64,
    ) {
        if self.paths.ack_lock_count() >= MAX_ACK_CHECKS {
            tracing::warn!(window = %project.window, "ack-check capacity reached, skipping");
            return;
        }
        let paths = self.paths.clone();
        let classifier = self.classifier.clone();
        let window = project.window.clone();
        let dir = project.dir.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let lock_path = paths.ack_lock(&window);
            let Ok(Some(_lock)) = lockfile::try_acquire(&lock_path, Duration::from_secs(120))
            else {
                return;
            };
            let deadline = tokio::time::Instant::now() + ACK_WINDOW;
            let mut acked: Option<&'static str> = None;
            while tokio::time::Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(5)).await;
                if let Ok(head) = git::head(&dir).await {
                    if head.is_some() && head.as_deref() != pre_head.as_deref() {
                        acked = Some("new_commit");
                        break;
                    }
                }
                let obs = classifier.observe(&window).await;
                if obs.status == WindowStatus::Working && pre_status != WindowStatus::Working {
                    acked = Some("working");
                    break;
                }
                if obs.context_num != -1 && obs.context_num != pre_context {
                    acked = Some("context_changed");
                    break;
                }
            }
            match acked {
                Some(evidence) => tracing::info!(window = %window, evidence, "nudge acked"),
                None => tracing::warn!(window = %window, "no ack within 60s"),
            }
        });
        self.background.push(handle);
    }

    async fn on_new_commits(&mut self, project: &Project, update: &review::CommitUpdate) {
        let window = project.window.clone();
        let dir = project.dir.clone();
        let paths = self.paths.clone();
        let subject = update.subject.clone();
        let engine = self.cfg.prd_engine.clone();
        let range = format!("HEAD~{}..HEAD", update.new_commits.max(1));

        let handle = tokio::spawn(async move {
            let changed = git::changed_files(&dir, &range).await.unwrap_or_default();
            review::layer1_checks(&paths, &window, &dir, &subject).await;
            review::prd_verify(&paths, &window, &dir, &changed, engine.as_deref()).await;
        });
        self.background.push(handle);
    }

    /// TODO-list change detection by content hash; new items reset the
    /// nudge backoff so the assistant hears about them promptly.
    fn detect_todo_change(&self, project: &Project) {
        let window = project.window.as_str();
        let content = crate::nudge::todo_content(&project.dir);
        if content.is_empty() {
            return;
        }
        let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
        let stored = state_store::read_scalar(&self.paths.todo_hash(window));
        if stored.as_deref() == Some(hash.as_str()) {
            return;
        }
        let _ = state_store::write_scalar_atomic(&self.paths.todo_hash(window), &hash);
        if stored.is_none() {
            return; // first observation, not a change
        }
        let remaining = crate::nudge::todo_remaining(&project.dir);
        state_store::remove(&self.paths.nudge_attempts(window));
        state_store::remove(&self.paths.alert_stalled(window));
        tracing::info!(window, remaining, "todo list changed, backoff reset");
        self.notifier
            .notify(&notify::format_new_todo_items(window, remaining));
    }

    /// One-shot alerts surfaced straight from the observation.
    fn surface_alerts(&self, window: &str, obs: &Observation) {
        if let Some(reason) = &obs.manual_block_reason {
            let flag = self.paths.alert_manual_block(window);
            if !flag.exists() {
                let _ = state_store::touch(&flag);
                self.notifier
                    .notify(&notify::format_manual_block(window, reason));
            }
        } else {
            state_store::remove(&self.paths.alert_manual_block(window));
        }

        if obs.context_num != -1 && obs.context_num <= self.cfg.low_context_critical {
            let flag = self.paths.alert_low_context_critical(window);
            if !flag.exists() {
                let _ = state_store::touch(&flag);
                self.notifier
                    .notify(&notify::format_low_context_critical(window, obs.context_num));
            }
        } else if obs.context_num > self.cfg.low_context_critical {
            state_store::remove(&self.paths.alert_low_context_critical(window));
        }
    }

    /// Compaction bookkeeping: the low → high context transition arms the
    /// post-compact recovery nudge; a context still low long after the
    /// `/compact` counts as a failure, three in a row alert.
    async fn track_compaction(&self, window: &str, obs: &Observation) {
        let threshold = self.cfg.low_context_threshold;
        let compact_sent = self.paths.compact_sent(window);

        if obs.context_num != -1 && obs.context_num <= threshold && obs.context_num >= 1 {
            let _ = state_store::touch(&self.paths.was_low_context(window));
        }

        if obs.context_num > threshold {
            if self.paths.was_low_context(window).exists() {
                let _ = state_store::touch(&self.paths.post_compact(window));
                tracing::info!(window, context = obs.context_num, "context recovered, recovery nudge armed");
            }
            if compact_sent.exists() {
                state_store::remove(&compact_sent);
                state_store::remove(&self.paths.compact_failures(window));
            }
        } else if obs.context_num != -1 {
            if let Some(age) = state_store::file_age_seconds(&compact_sent) {
                if age >= COMPACT_FAIL_AFTER {
                    let failures = state_store::read_u64(&self.paths.compact_failures(window)) + 1;
                    let _ =
                        state_store::write_u64_atomic(&self.paths.compact_failures(window), failures);
                    state_store::remove(&compact_sent);
                    tracing::warn!(window, failures, "compact did not recover context");
                    if failures == 3 {
                        self.notifier
                            .notify(&notify::format_compact_failed(window, failures));
                    }
                }
            }
        }
    }

    /// Working-stall tracking: HEAD and context frozen for 15 min logs a
    /// warning; 30 min emits a one-shot alert.
    fn track_working_stall(&self, window: &str, obs: &Observation) {
        let head = state_store::read_scalar(&self.paths.commits_head(window)).unwrap_or_default();
        let record = format!("head={head}\ncontext={}", obs.context_num);
        let track = self.paths.stall_track(window);
        let stored = state_store::read_scalar(&track);

        let unchanged = stored
            .as_deref()
            .is_some_and(|s| s.lines().take(2).collect::<Vec<_>>().join("\n") == record);
        if !unchanged {
            let body = format!("{record}\nsince={}", state_store::now_unix());
            let _ = state_store::write_scalar_atomic(&track, &body);
            state_store::remove(&self.paths.alert_working_stall(window));
            return;
        }

        let since = stored
            .and_then(|s| {
                s.lines()
                    .find_map(|l| l.strip_prefix("since=").map(str::to_string))
            })
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let stalled_for = state_store::now_unix().saturating_sub(since);
        if stalled_for >= WORKING_STALL_ALERT {
            let flag = self.paths.alert_working_stall(window);
            if !flag.exists() {
                let _ = state_store::touch(&flag);
                self.notifier
                    .notify(&notify::format_working_stall(window, stalled_for / 60));
            }
        } else if stalled_for >= WORKING_STALL_WARN {
            tracing::warn!(window, minutes = stalled_for / 60, "working with no visible progress");
        }
    }

    fn maybe_log_status(&self, window: &str, obs: &Observation) {
        let interval_cycles = (STATUS_LOG_SECS / self.cfg.tick_secs.max(1)).max(1);
        if self.cycles % interval_cycles == 0 {
            tracing::info!(
                window,
                status = obs.status.as_str(),
                context = obs.context_num,
                "status"
            );
        }
    }

    async fn write_snapshot(&self, window: &str, project: &Project, obs: &Observation) {
        let head = state_store::read_scalar(&self.paths.commits_head(window))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "none".to_string());
        let commits_30m = git::commits_since_minutes(&project.dir, 30).await.unwrap_or(0);
        let prev = WindowSnapshot::load(&self.paths.snapshot(window));
        let working_no_commit = if obs.status == WindowStatus::Working {
            if commits_30m == 0 {
                prev.working_no_commit + 1
            } else {
                0
            }
        } else {
            prev.working_no_commit
        };
        let snapshot = WindowSnapshot {
            status: obs.status.as_str().to_string(),
            context_num: obs.context_num,
            head: if head.len() > 7 {
                head[..7].to_string()
            } else {
                head
            },
            commit_msg: git::head_subject(&project.dir)
                .await
                .unwrap_or_default()
                .chars()
                .take(80)
                .collect(),
            commit_time: git::head_commit_time(&project.dir).await.unwrap_or(0),
            commits_30m,
            working_no_commit,
            tokens_today: prev.tokens_today,
            last_check: state_store::now_unix(),
        };
        if let Err(e) = snapshot.store(&self.paths.snapshot(window)) {
            tracing::warn!(window, error = %e, "snapshot write failed");
        }
    }

    /// Truncates the main log to its line budget and ages out the state
    /// directories.
    fn rotate_logs(&self) {
        let log = self.paths.log_file();
        if let Ok(content) = std::fs::read_to_string(&log) {
            let lines: Vec<&str> = content.lines().collect();
            if lines.len() > LOG_LINE_BUDGET {
                let keep = &lines[lines.len() - LOG_LINE_BUDGET / 2..];
                let _ = std::fs::write(&log, format!("{}\n", keep.join("\n")));
                tracing::info!(dropped = lines.len() - keep.len(), "log truncated");
            }
        }
        state_store::gc_older_than(&self.paths.cooldown_dir(), 1);
        state_store::gc_older_than(&self.paths.activity_dir(), 1);
    }

    async fn graceful_shutdown(&mut self) {
        tracing::info!(tasks = self.background.len(), "shutting down");
        for handle in &self.background {
            handle.abort();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        for handle in self.background.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = tokio::time::timeout(remaining, handle).await;
        }
        // Ack locks owned by aborted tasks are cleaned up here; their
        // staleness TTL would cover a SIGKILL.
        for project in &self.cfg.projects {
            lockfile::release(&self.paths.ack_lock(&project.window));
        }
        tracing::info!("supervisor stopped");
        // The global lock releases on drop in run().
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use tempfile::TempDir;

    fn config_in(dir: &std::path::Path) -> AutopilotConfig {
        AutopilotConfig::load(dir).unwrap()
    }

    #[test]
    fn test_supervisor_construction() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_in(tmp.path());
        let sup = Supervisor::new(cfg, Arc::new(NoopNotifier));
        assert_eq!(sup.paths().base(), tmp.path());
    }

    #[tokio::test]
    async fn test_track_compaction_arms_recovery() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_in(tmp.path());
        let sup = Supervisor::new(cfg, Arc::new(NoopNotifier));
        sup.paths.ensure_layout().unwrap();

        let mut obs = Observation {
            status: WindowStatus::IdleLowContext,
            context_num: 20,
            weekly_limit_pct: None,
            manual_block_reason: None,
            last_activity: None,
        };
        sup.track_compaction("web", &obs).await;
        assert!(sup.paths.was_low_context("web").exists());
        assert!(!sup.paths.post_compact("web").exists());

        // Context recovered: recovery nudge armed.
        obs.context_num = 85;
        sup.track_compaction("web", &obs).await;
        assert!(sup.paths.post_compact("web").exists());
    }

    #[tokio::test]
    async fn test_track_compaction_counts_failures() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_in(tmp.path());
        let sup = Supervisor::new(cfg, Arc::new(NoopNotifier));
        sup.paths.ensure_layout().unwrap();

        // A compact sent long ago with context still low is a failure.
        let sent = sup.paths.compact_sent("web");
        state_store::write_u64_atomic(&sent, 1).unwrap();
        backdate(&sent, 400);

        let obs = Observation {
            status: WindowStatus::IdleLowContext,
            context_num: 18,
            weekly_limit_pct: None,
            manual_block_reason: None,
            last_activity: None,
        };
        sup.track_compaction("web", &obs).await;
        assert_eq!(state_store::read_u64(&sup.paths.compact_failures("web")), 1);
        assert!(!sent.exists());
    }

    #[cfg(unix)]
    fn backdate(path: &std::path::Path, secs_ago: i64) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let tv = nix::libc::timeval {
            tv_sec: now - secs_ago,
            tv_usec: 0,
        };
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).unwrap();
        unsafe { nix::libc::utimes(c_path.as_ptr(), [tv, tv].as_ptr()) };
    }

    #[test]
    fn test_todo_change_resets_backoff() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_in(tmp.path());
        let sup = Supervisor::new(cfg, Arc::new(NoopNotifier));
        sup.paths.ensure_layout().unwrap();

        let project_dir = tmp.path().join("proj");
        std::fs::create_dir_all(project_dir.join(".autopilot")).unwrap();
        let project = Project {
            window: "web".into(),
            dir: project_dir.clone(),
            default_nudge: None,
        };

        std::fs::write(project_dir.join(".autopilot/todo.md"), "- [ ] a\n").unwrap();
        // First observation: hash recorded, no reset.
        sup.detect_todo_change(&project);
        state_store::write_u64_atomic(&sup.paths.nudge_attempts("web"), 4).unwrap();

        // Unchanged content: nothing happens.
        sup.detect_todo_change(&project);
        assert_eq!(state_store::read_u64(&sup.paths.nudge_attempts("web")), 4);

        // New item: backoff resets.
        std::fs::write(project_dir.join(".autopilot/todo.md"), "- [ ] a\n- [ ] b\n").unwrap();
        sup.detect_todo_change(&project);
        assert!(!sup.paths.nudge_attempts("web").exists());
    }

    #[test]
    fn test_working_stall_alert_is_one_shot() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_in(tmp.path());
        struct Counting(std::sync::atomic::AtomicUsize);
        impl Notifier for Counting {
            fn notify(&self, _: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counting(std::sync::atomic::AtomicUsize::new(0)));
        let sup = Supervisor::new(cfg, counter.clone());
        sup.paths.ensure_layout().unwrap();

        let obs = Observation {
            status: WindowStatus::Working,
            context_num: 50,
            weekly_limit_pct: None,
            manual_block_reason: None,
            last_activity: None,
        };
        // Seed an old stall record matching the current observation.
        let record = format!(
            "head=\ncontext=50\nsince={}",
            state_store::now_unix() - WORKING_STALL_ALERT - 10
        );
        state_store::write_scalar_atomic(&sup.paths.stall_track("web"), &record).unwrap();

        sup.track_working_stall("web", &obs);
        sup.track_working_stall("web", &obs);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_startup_cleanup_drops_unknown_snapshots() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.yaml"),
            "projects:\n  - window: web\n    dir: /src/web\n",
        )
        .unwrap();
        let cfg = config_in(tmp.path());
        let sup = Supervisor::new(cfg, Arc::new(NoopNotifier));
        sup.paths.ensure_layout().unwrap();

        let known = sup.paths.snapshot("web");
        let unknown = sup.paths.snapshot("gone");
        WindowSnapshot::default().store(&known).unwrap();
        WindowSnapshot::default().store(&unknown).unwrap();

        sup.startup_cleanup();
        assert!(known.exists());
        assert!(!unknown.exists());
    }
}
