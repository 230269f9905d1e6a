//! Ordered rule evaluation: match, guard chain, action.
//!
//! Rules are evaluated in declaration order; the first rule whose match and
//! full guard chain pass decides the tick: at most one action per window
//! per tick. Guards are predicates with narrowly-scoped side effects (probe
//! counters, flag expiry, the one-shot stall alert) and short-circuit on
//! the first SKIP. Every evaluation emits one decision-trace log line.

use crate::classifier::{Observation, WindowStatus};
use crate::notify::{self, Notifier};
use crate::paths::{sanitize_window, StatePaths};
use crate::state_store;
use serde::Deserialize;
use thiserror::Error;

/// Exponent clamp for nudge backoff: cooldown stops doubling past 2^5.
pub const BACKOFF_CLAMP: u64 = 5;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("duplicate rule name '{0}'")]
    DuplicateName(String),

    #[error("rule '{rule}': unknown status '{status}'")]
    UnknownStatus { rule: String, status: String },

    #[error("rule '{rule}': template '{template}' is not defined")]
    UnknownTemplate { rule: String, template: String },

    #[error("rule '{rule}': guard parameter out of range: {detail}")]
    BadGuardParam { rule: String, detail: String },

    #[error("no rule matches the '{0}' state (a safe no-op rule for it is required)")]
    MissingCoverage(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ApprovePermission,
    SendNudge,
    SendCompact,
    ResumeShell,
    WriteReviewTrigger,
    /// The safe no-op: matches and ends the tick without acting.
    Observe,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ApprovePermission => "approve-permission",
            ActionKind::SendNudge => "send-nudge",
            ActionKind::SendCompact => "send-compact",
            ActionKind::ResumeShell => "resume-shell",
            ActionKind::WriteReviewTrigger => "write-review-trigger",
            ActionKind::Observe => "observe",
        }
    }
}

/// Guard kinds with their required parameters. Deserialization fails when
/// a parameter is missing, which is the rule-validation contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Guard {
    ManualTaskTtl { ttl_secs: u64 },
    PrdDone,
    ExponentialBackoff { base_secs: u64, max_retries: u64 },
    FixedCooldown { key: String, secs: u64 },
    WorkingInertia { window_secs: u64 },
    IdleConfirmations { n: u64 },
    LowContextThreshold { pct: i64 },
    WeeklyLimitLow { pct: u8 },
    DailyLimit { per_window: u64, global: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Skip(String),
}

/// Everything a guard may consult for one window in one tick. Derived
/// fields are computed once by the supervisor before evaluation.
pub struct GuardCtx<'a> {
    pub paths: &'a StatePaths,
    pub window: &'a str,
    pub obs: &'a Observation,
    pub now: u64,
    /// Seconds since the window was last seen working; `None` = never.
    pub activity_age: Option<u64>,
    pub todo_remaining: usize,
    pub has_autocheck_issues: bool,
    pub has_prd_issues: bool,
    /// Latest Layer-2 review outcome was CLEAN.
    pub review_clean: bool,
    pub queue_has_next: bool,
    /// The review-trigger preconditions hold (computed by the emitter).
    pub review_due: bool,
    /// Post-compact recovery flag is set.
    pub post_compact: bool,
    pub notifier: &'a dyn Notifier,
}

/// Effective nudge cooldown for a given attempt count: `base · 2^min(n, 5)`.
/// Monotonic non-decreasing in `n`.
pub fn effective_backoff(base_secs: u64, attempts: u64) -> u64 {
    base_secs.saturating_mul(1u64 << attempts.min(BACKOFF_CLAMP))
}

impl Guard {
    pub fn name(&self) -> &'static str {
        match self {
            Guard::ManualTaskTtl { .. } => "manual_task_ttl",
            Guard::PrdDone => "prd_done",
            Guard::ExponentialBackoff { .. } => "exponential_backoff",
            Guard::FixedCooldown { .. } => "fixed_cooldown",
            Guard::WorkingInertia { .. } => "working_inertia",
            Guard::IdleConfirmations { .. } => "idle_confirmations",
            Guard::LowContextThreshold { .. } => "low_context_threshold",
            Guard::WeeklyLimitLow { .. } => "weekly_limit_low",
            Guard::DailyLimit { .. } => "daily_limit",
        }
    }

    pub fn evaluate(&self, ctx: &GuardCtx<'_>) -> Verdict {
        match self {
            Guard::ManualTaskTtl { ttl_secs } => {
                let flag = ctx.paths.manual_task(ctx.window);
                match state_store::file_age_seconds(&flag) {
                    Some(age) if age <= *ttl_secs => {
                        Verdict::Skip(format!("manual_task({age}s)"))
                    }
                    Some(_) => {
                        // Aged out: consume the flag and proceed.
                        state_store::remove(&flag);
                        Verdict::Pass
                    }
                    None => Verdict::Pass,
                }
            }

            Guard::PrdDone => {
                let done_and_clean = ctx.todo_remaining == 0
                    && !ctx.has_autocheck_issues
                    && !ctx.has_prd_issues
                    && ctx.review_clean;
                if done_and_clean && !ctx.queue_has_next {
                    Verdict::Skip("prd_done".to_string())
                } else {
                    Verdict::Pass
                }
            }

            Guard::ExponentialBackoff {
                base_secs,
                max_retries,
            } => {
                let attempts = state_store::read_u64(&ctx.paths.nudge_attempts(ctx.window));
                if attempts >= *max_retries {
                    let alert = ctx.paths.alert_stalled(ctx.window);
                    if !alert.exists() {
                        // One-shot: the flag makes repeat exhaustion silent
                        // until a state change clears it.
                        let _ = state_store::touch(&alert);
                        ctx.notifier
                            .notify(&notify::format_stalled(ctx.window, attempts));
                    }
                    return Verdict::Skip("max_retries_exceeded".to_string());
                }
                let cooldown = effective_backoff(*base_secs, attempts);
                let last = state_store::read_u64(
                    &ctx.paths
                        .cooldown(&format!("nudge-{}", sanitize_window(ctx.window))),
                );
                let elapsed = ctx.now.saturating_sub(last);
                if last > 0 && elapsed <= cooldown {
                    Verdict::Skip(format!("backoff({elapsed}s/{cooldown}s)"))
                } else {
                    Verdict::Pass
                }
            }

            Guard::FixedCooldown { key, secs } => {
                let file = ctx
                    .paths
                    .cooldown(&format!("{key}-{}", sanitize_window(ctx.window)));
                let last = state_store::read_u64(&file);
                let elapsed = ctx.now.saturating_sub(last);
                if last > 0 && elapsed <= *secs {
                    Verdict::Skip(format!("cooldown:{key}({elapsed}s/{secs}s)"))
                } else {
                    Verdict::Pass
                }
            }

            Guard::WorkingInertia { window_secs } => match ctx.activity_age {
                Some(age) if age <= *window_secs => {
                    // Recently working: the probe streak starts over.
                    state_store::remove(&ctx.paths.idle_probe(ctx.window));
                    Verdict::Skip(format!("working_inertia({age}s)"))
                }
                _ => Verdict::Pass,
            },

            Guard::IdleConfirmations { n } => {
                let probe = ctx.paths.idle_probe(ctx.window);
                let count = state_store::read_u64(&probe) + 1;
                let _ = state_store::write_u64_atomic(&probe, count);
                if count >= *n {
                    Verdict::Pass
                } else {
                    Verdict::Skip(format!("idle_confirmations({count}/{n})"))
                }
            }

            Guard::LowContextThreshold { pct } => {
                if (1..=*pct).contains(&ctx.obs.context_num) {
                    Verdict::Pass
                } else {
                    Verdict::Skip(format!("context_not_low({})", ctx.obs.context_num))
                }
            }

            Guard::WeeklyLimitLow { pct } => match ctx.obs.weekly_limit_pct {
                Some(left) if left <= *pct => Verdict::Skip(format!("weekly_limit_low({left}%)")),
                _ => Verdict::Pass,
            },

            Guard::DailyLimit { per_window, global } => {
                let today = today_stamp();
                let (sends, date) = read_daily(ctx.paths, Some(ctx.window));
                let sends = if date == today { sends } else { 0 };
                if sends >= *per_window {
                    return Verdict::Skip(format!("daily_limit_window({sends})"));
                }
                let (total, date) = read_daily(ctx.paths, None);
                let total = if date == today { total } else { 0 };
                if total >= *global {
                    return Verdict::Skip(format!("daily_limit_global({total})"));
                }
                Verdict::Pass
            }
        }
    }
}

fn today_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

fn daily_keys(window: Option<&str>) -> (String, String) {
    match window {
        Some(w) => {
            let w = sanitize_window(w);
            (format!("daily-sends-{w}"), format!("daily-date-{w}"))
        }
        None => ("daily-sends-total".to_string(), "daily-date-total".to_string()),
    }
}

fn read_daily(paths: &StatePaths, window: Option<&str>) -> (u64, String) {
    let (sends_key, date_key) = daily_keys(window);
    (
        state_store::read_u64(&paths.cooldown(&sends_key)),
        state_store::read_scalar(&paths.cooldown(&date_key)).unwrap_or_default(),
    )
}

/// Bumps the per-window and global daily send counters, resetting on date
/// change. Called after every successful nudge.
pub fn record_daily_send(paths: &StatePaths, window: &str) {
    let today = today_stamp();
    for scope in [Some(window), None] {
        let (sends_key, date_key) = daily_keys(scope);
        let (sends, date) = read_daily(paths, scope);
        let next = if date == today { sends + 1 } else { 1 };
        let _ = state_store::write_u64_atomic(&paths.cooldown(&sends_key), next);
        let _ = state_store::write_scalar_atomic(&paths.cooldown(&date_key), &today);
    }
}

/// One rule: name, match predicate, ordered guards, action.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub statuses: Vec<WindowStatus>,
    /// Match only when the review-trigger preconditions hold.
    pub review_due: bool,
    /// Match only when the post-compact recovery flag is set.
    pub post_compact: bool,
    pub guards: Vec<Guard>,
    pub action: ActionKind,
    pub template: Option<String>,
}

impl Rule {
    fn matches(&self, ctx: &GuardCtx<'_>) -> bool {
        self.statuses.contains(&ctx.obs.status)
            && (!self.review_due || ctx.review_due)
            && (!self.post_compact || ctx.post_compact)
    }
}

/// YAML form of a rule, as loaded from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub statuses: Vec<String>,
    #[serde(default)]
    pub review_due: bool,
    #[serde(default)]
    pub post_compact: bool,
    #[serde(default)]
    pub guards: Vec<Guard>,
    pub action: ActionKind,
    #[serde(default)]
    pub template: Option<String>,
}

/// The decision of one tick for one window.
#[derive(Debug, Clone)]
pub struct Decision {
    pub rule: String,
    pub action: ActionKind,
    pub template: Option<String>,
}

/// An ordered, validated rule list.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

fn parse_status(s: &str) -> Option<WindowStatus> {
    Some(match s {
        "working" => WindowStatus::Working,
        "idle" => WindowStatus::Idle,
        "idle_low_context" => WindowStatus::IdleLowContext,
        "permission" => WindowStatus::Permission,
        "permission_with_remember" => WindowStatus::PermissionWithRemember,
        "shell" => WindowStatus::Shell,
        "absent" => WindowStatus::Absent,
        _ => return None,
    })
}

impl Default for RuleSet {
    /// The built-in rule order. Permission approval outranks everything;
    /// the idle nudge comes last among the acting rules so compaction and
    /// review triggers win an idle tick.
    fn default() -> Self {
        use ActionKind::*;
        use WindowStatus::*;
        let rules = vec![
            Rule {
                name: "approve-permission".into(),
                statuses: vec![Permission, PermissionWithRemember],
                review_due: false,
                post_compact: false,
                guards: vec![Guard::FixedCooldown {
                    key: "permission".into(),
                    secs: 60,
                }],
                action: ApprovePermission,
                template: None,
            },
            Rule {
                name: "compact-low-context".into(),
                statuses: vec![IdleLowContext],
                review_due: false,
                post_compact: false,
                guards: vec![
                    Guard::LowContextThreshold { pct: 25 },
                    Guard::FixedCooldown {
                        key: "compact".into(),
                        secs: 600,
                    },
                ],
                action: SendCompact,
                template: None,
            },
            Rule {
                name: "resume-shell".into(),
                statuses: vec![Shell],
                review_due: false,
                post_compact: false,
                guards: vec![Guard::FixedCooldown {
                    key: "shell".into(),
                    secs: 300,
                }],
                action: ResumeShell,
                template: None,
            },
            Rule {
                name: "review-trigger".into(),
                statuses: vec![Idle],
                review_due: true,
                post_compact: false,
                guards: vec![Guard::FixedCooldown {
                    key: "review".into(),
                    secs: 1800,
                }],
                action: WriteReviewTrigger,
                template: None,
            },
            Rule {
                name: "post-compact-recovery".into(),
                statuses: vec![Idle, IdleLowContext],
                review_due: false,
                post_compact: true,
                guards: vec![Guard::WorkingInertia { window_secs: 90 }],
                action: SendNudge,
                template: Some("recovery".into()),
            },
            Rule {
                name: "idle-nudge".into(),
                statuses: vec![Idle, IdleLowContext],
                review_due: false,
                post_compact: false,
                guards: vec![
                    Guard::ManualTaskTtl { ttl_secs: 300 },
                    Guard::WorkingInertia { window_secs: 90 },
                    Guard::IdleConfirmations { n: 3 },
                    Guard::PrdDone,
                    Guard::WeeklyLimitLow { pct: 5 },
                    Guard::DailyLimit {
                        per_window: 50,
                        global: 200,
                    },
                    Guard::ExponentialBackoff {
                        base_secs: 300,
                        max_retries: 6,
                    },
                ],
                action: SendNudge,
                template: Some("nudge".into()),
            },
            Rule {
                name: "watch-working".into(),
                statuses: vec![Working],
                review_due: false,
                post_compact: false,
                guards: vec![],
                action: Observe,
                template: None,
            },
            Rule {
                name: "watch-absent".into(),
                statuses: vec![Absent],
                review_due: false,
                post_compact: false,
                guards: vec![],
                action: Observe,
                template: None,
            },
        ];
        Self { rules }
    }
}

impl RuleSet {
    /// Builds a rule set from configuration specs, validating names,
    /// statuses, template references, guard parameters and coverage of the
    /// `absent` and `working` states.
    pub fn from_specs(
        specs: &[RuleSpec],
        templates: &std::collections::HashMap<String, String>,
    ) -> Result<Self, RuleError> {
        let mut seen = std::collections::HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.name.clone()) {
                return Err(RuleError::DuplicateName(spec.name.clone()));
            }
            let mut statuses = Vec::with_capacity(spec.statuses.len());
            for s in &spec.statuses {
                statuses.push(parse_status(s).ok_or_else(|| RuleError::UnknownStatus {
                    rule: spec.name.clone(),
                    status: s.clone(),
                })?);
            }
            if let Some(template) = &spec.template {
                let builtin = template == "nudge" || template == "recovery";
                if !builtin && !templates.contains_key(template) {
                    return Err(RuleError::UnknownTemplate {
                        rule: spec.name.clone(),
                        template: template.clone(),
                    });
                }
            }
            for guard in &spec.guards {
                validate_guard(&spec.name, guard)?;
            }
            rules.push(Rule {
                name: spec.name.clone(),
                statuses,
                review_due: spec.review_due,
                post_compact: spec.post_compact,
                guards: spec.guards.clone(),
                action: spec.action,
                template: spec.template.clone(),
            });
        }
        let set = Self { rules };
        set.check_coverage()?;
        Ok(set)
    }

    fn check_coverage(&self) -> Result<(), RuleError> {
        for (status, name) in [
            (WindowStatus::Absent, "absent"),
            (WindowStatus::Working, "working"),
        ] {
            if !self.rules.iter().any(|r| r.statuses.contains(&status)) {
                return Err(RuleError::MissingCoverage(name));
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluates the rules for one window-tick. Returns at most one
    /// decision; every rule considered leaves a decision-trace line.
    pub fn evaluate(&self, ctx: &GuardCtx<'_>) -> Option<Decision> {
        for rule in &self.rules {
            if !rule.matches(ctx) {
                continue;
            }
            let mut trace = Vec::with_capacity(rule.guards.len());
            let mut skip: Option<String> = None;
            for guard in &rule.guards {
                match guard.evaluate(ctx) {
                    Verdict::Pass => trace.push(format!("{}=pass", guard.name())),
                    Verdict::Skip(reason) => {
                        trace.push(format!("{}=skip", guard.name()));
                        skip = Some(reason);
                        break;
                    }
                }
            }
            if let Some(reason) = skip {
                tracing::info!(
                    window = ctx.window,
                    rule = %rule.name,
                    guards = %trace.join(","),
                    skip = %reason,
                    "rule skipped"
                );
                continue;
            }
            tracing::info!(
                window = ctx.window,
                rule = %rule.name,
                guards = %trace.join(","),
                action = rule.action.as_str(),
                "rule selected"
            );
            return Some(Decision {
                rule: rule.name.clone(),
                action: rule.action,
                template: rule.template.clone(),
            });
        }
        tracing::info!(window = ctx.window, status = ctx.obs.status.as_str(), "no rule matched");
        None
    }
}

fn validate_guard(rule: &str, guard: &Guard) -> Result<(), RuleError> {
    let bad = |detail: String| RuleError::BadGuardParam {
        rule: rule.to_string(),
        detail,
    };
    match guard {
        Guard::ExponentialBackoff {
            base_secs,
            max_retries,
        } => {
            if *base_secs == 0 {
                return Err(bad("exponential_backoff.base_secs must be > 0".into()));
            }
            if *max_retries == 0 {
                return Err(bad("exponential_backoff.max_retries must be > 0".into()));
            }
        }
        Guard::FixedCooldown { key, secs } => {
            if key.is_empty() {
                return Err(bad("fixed_cooldown.key must be non-empty".into()));
            }
            if *secs == 0 {
                return Err(bad("fixed_cooldown.secs must be > 0".into()));
            }
        }
        Guard::IdleConfirmations { n } => {
            if *n == 0 {
                return Err(bad("idle_confirmations.n must be > 0".into()));
            }
        }
        Guard::LowContextThreshold { pct } => {
            if !(1..=100).contains(pct) {
                return Err(bad("low_context_threshold.pct must be in 1..=100".into()));
            }
        }
        Guard::DailyLimit { per_window, global } => {
            if *per_window == 0 || *global == 0 {
                return Err(bad("daily_limit caps must be > 0".into()));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use tempfile::TempDir;

    fn obs(status: WindowStatus) -> Observation {
        Observation {
            status,
            context_num: -1,
            weekly_limit_pct: None,
            manual_block_reason: None,
            last_activity: None,
        }
    }

    struct Fixture {
        _tmp: TempDir,
        paths: StatePaths,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = StatePaths::new(tmp.path());
        paths.ensure_layout().unwrap();
        Fixture { _tmp: tmp, paths }
    }

    fn ctx<'a>(
        fx: &'a Fixture,
        obs: &'a Observation,
        notifier: &'a dyn Notifier,
    ) -> GuardCtx<'a> {
        GuardCtx {
            paths: &fx.paths,
            window: "web",
            obs,
            now: state_store::now_unix(),
            activity_age: Some(10_000),
            todo_remaining: 4,
            has_autocheck_issues: false,
            has_prd_issues: false,
            review_clean: false,
            queue_has_next: false,
            review_due: false,
            post_compact: false,
            notifier,
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_clamped() {
        // Effective cooldown never decreases as attempts grow.
        let mut prev = 0;
        for n in 0..=8 {
            let c = effective_backoff(300, n);
            assert!(c >= prev, "c({n}) regressed");
            prev = c;
        }
        assert_eq!(effective_backoff(300, 0), 300);
        assert_eq!(effective_backoff(300, 1), 600);
        assert_eq!(effective_backoff(300, 5), 9600);
        assert_eq!(effective_backoff(300, 6), 9600);
    }

    #[test]
    fn test_manual_task_ttl_skip_then_consume() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::ManualTaskTtl { ttl_secs: 300 };

        // No flag: pass.
        assert_eq!(guard.evaluate(&c), Verdict::Pass);

        // Fresh flag: skip.
        state_store::touch(&fx.paths.manual_task("web")).unwrap();
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));

        // Aged-out flag: deleted and pass.
        let guard_zero = Guard::ManualTaskTtl { ttl_secs: 0 };
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(guard_zero.evaluate(&c), Verdict::Pass);
        assert!(!fx.paths.manual_task("web").exists());
    }

    #[test]
    fn test_idle_confirmations_pass_on_nth() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::IdleConfirmations { n: 3 };
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
    }

    #[test]
    fn test_working_inertia_skips_and_resets_probe() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let mut c = ctx(&fx, &o, &noop);
        state_store::write_u64_atomic(&fx.paths.idle_probe("web"), 2).unwrap();

        c.activity_age = Some(30);
        let guard = Guard::WorkingInertia { window_secs: 90 };
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        assert!(!fx.paths.idle_probe("web").exists());

        c.activity_age = Some(91);
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
    }

    #[test]
    fn test_working_inertia_boundary_inclusive() {
        // An age exactly at the window does not yet pass; one second more does.
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let mut c = ctx(&fx, &o, &noop);
        let guard = Guard::WorkingInertia { window_secs: 90 };
        c.activity_age = Some(90);
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        c.activity_age = Some(91);
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
    }

    #[test]
    fn test_fixed_cooldown_boundary() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::FixedCooldown {
            key: "permission".into(),
            secs: 60,
        };
        assert_eq!(guard.evaluate(&c), Verdict::Pass);

        // Stamp now: still inside the cooldown.
        state_store::write_u64_atomic(&fx.paths.cooldown("permission-web"), c.now).unwrap();
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));

        // Exactly at the threshold: still skipped; one past: passes.
        state_store::write_u64_atomic(&fx.paths.cooldown("permission-web"), c.now - 60).unwrap();
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        state_store::write_u64_atomic(&fx.paths.cooldown("permission-web"), c.now - 61).unwrap();
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
    }

    #[test]
    fn test_backoff_skips_within_effective_cooldown() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::ExponentialBackoff {
            base_secs: 300,
            max_retries: 6,
        };

        // Attempt 1 recorded 305s ago: effective cooldown is 600s → skip.
        state_store::write_u64_atomic(&fx.paths.nudge_attempts("web"), 1).unwrap();
        state_store::write_u64_atomic(&fx.paths.cooldown("nudge-web"), c.now - 305).unwrap();
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));

        // 605s ago: passes.
        state_store::write_u64_atomic(&fx.paths.cooldown("nudge-web"), c.now - 605).unwrap();
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
    }

    struct CountingNotifier(std::sync::atomic::AtomicUsize);
    impl Notifier for CountingNotifier {
        fn notify(&self, _text: &str) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_backoff_exhaustion_alerts_once() {
        // One stall condition, one notification.
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let counting = CountingNotifier(std::sync::atomic::AtomicUsize::new(0));
        let c = ctx(&fx, &o, &counting);
        let guard = Guard::ExponentialBackoff {
            base_secs: 300,
            max_retries: 6,
        };
        state_store::write_u64_atomic(&fx.paths.nudge_attempts("web"), 6).unwrap();

        for _ in 0..10 {
            assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        }
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(fx.paths.alert_stalled("web").exists());

        // A state change clears the flag; the next exhaustion alerts again.
        state_store::remove(&fx.paths.alert_stalled("web"));
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prd_done_bypass_via_queue() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let mut c = ctx(&fx, &o, &noop);
        c.todo_remaining = 0;
        c.review_clean = true;
        assert!(matches!(Guard::PrdDone.evaluate(&c), Verdict::Skip(_)));

        c.queue_has_next = true;
        assert_eq!(Guard::PrdDone.evaluate(&c), Verdict::Pass);
    }

    #[test]
    fn test_weekly_limit_guard() {
        let fx = fixture();
        let mut o = obs(WindowStatus::Idle);
        o.weekly_limit_pct = Some(4);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::WeeklyLimitLow { pct: 5 };
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
    }

    #[test]
    fn test_daily_limit_and_record() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let guard = Guard::DailyLimit {
            per_window: 2,
            global: 100,
        };
        assert_eq!(guard.evaluate(&c), Verdict::Pass);
        record_daily_send(&fx.paths, "web");
        record_daily_send(&fx.paths, "web");
        assert!(matches!(guard.evaluate(&c), Verdict::Skip(_)));
    }

    #[test]
    fn test_default_rules_cover_absent_and_working() {
        let set = RuleSet::default();
        assert!(set.check_coverage().is_ok());
    }

    #[test]
    fn test_evaluate_permission_outranks_nudge() {
        let fx = fixture();
        let o = obs(WindowStatus::PermissionWithRemember);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let decision = RuleSet::default().evaluate(&c).unwrap();
        assert_eq!(decision.rule, "approve-permission");
        assert_eq!(decision.action, ActionKind::ApprovePermission);
    }

    #[test]
    fn test_evaluate_working_is_observe_only() {
        // Under no observed state are two actions selected; working
        // selects the safe no-op.
        let fx = fixture();
        let o = obs(WindowStatus::Working);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let decision = RuleSet::default().evaluate(&c).unwrap();
        assert_eq!(decision.action, ActionKind::Observe);
    }

    #[test]
    fn test_evaluate_idle_nudge_after_confirmations() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let c = ctx(&fx, &o, &noop);
        let set = RuleSet::default();

        // Two confirmation ticks skip, the third nudges.
        assert!(set.evaluate(&c).is_none());
        assert!(set.evaluate(&c).is_none());
        let decision = set.evaluate(&c).unwrap();
        assert_eq!(decision.action, ActionKind::SendNudge);
        assert_eq!(decision.template.as_deref(), Some("nudge"));
    }

    #[test]
    fn test_post_compact_recovery_outranks_plain_nudge() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let mut c = ctx(&fx, &o, &noop);
        c.post_compact = true;
        let decision = RuleSet::default().evaluate(&c).unwrap();
        assert_eq!(decision.rule, "post-compact-recovery");
        assert_eq!(decision.template.as_deref(), Some("recovery"));
    }

    #[test]
    fn test_review_due_rule() {
        let fx = fixture();
        let o = obs(WindowStatus::Idle);
        let noop = NoopNotifier;
        let mut c = ctx(&fx, &o, &noop);
        c.review_due = true;
        let decision = RuleSet::default().evaluate(&c).unwrap();
        assert_eq!(decision.action, ActionKind::WriteReviewTrigger);
    }

    #[test]
    fn test_from_specs_rejects_duplicates() {
        let spec = RuleSpec {
            name: "a".into(),
            statuses: vec!["working".into()],
            review_due: false,
            post_compact: false,
            guards: vec![],
            action: ActionKind::Observe,
            template: None,
        };
        let err = RuleSet::from_specs(&[spec.clone(), spec], &Default::default()).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateName(_)));
    }

    #[test]
    fn test_from_specs_rejects_unknown_template() {
        let spec = RuleSpec {
            name: "a".into(),
            statuses: vec!["working".into(), "absent".into(), "idle".into()],
            review_due: false,
            post_compact: false,
            guards: vec![],
            action: ActionKind::SendNudge,
            template: Some("nope".into()),
        };
        let err = RuleSet::from_specs(&[spec], &Default::default()).unwrap_err();
        assert!(matches!(err, RuleError::UnknownTemplate { .. }));
    }

    #[test]
    fn test_from_specs_requires_coverage() {
        let spec = RuleSpec {
            name: "only-idle".into(),
            statuses: vec!["idle".into()],
            review_due: false,
            post_compact: false,
            guards: vec![],
            action: ActionKind::Observe,
            template: None,
        };
        let err = RuleSet::from_specs(&[spec], &Default::default()).unwrap_err();
        assert!(matches!(err, RuleError::MissingCoverage(_)));
    }

    #[test]
    fn test_from_specs_rejects_bad_guard_params() {
        let spec = RuleSpec {
            name: "a".into(),
            statuses: vec!["working".into(), "absent".into()],
            review_due: false,
            post_compact: false,
            guards: vec![Guard::IdleConfirmations { n: 0 }],
            action: ActionKind::Observe,
            template: None,
        };
        let err = RuleSet::from_specs(&[spec], &Default::default()).unwrap_err();
        assert!(matches!(err, RuleError::BadGuardParam { .. }));
    }

    #[test]
    fn test_guard_yaml_missing_param_fails() {
        // Required parameters are part of the type; omitting one is a
        // deserialization error, which is the startup validation contract.
        let bad: Result<Guard, _> = serde_yaml::from_str("kind: fixed_cooldown\nkey: permission\n");
        assert!(bad.is_err());
        let ok: Result<Guard, _> =
            serde_yaml::from_str("kind: fixed_cooldown\nkey: permission\nsecs: 60\n");
        assert!(ok.is_ok());
    }
}
