//! Window state classification from pane text and the process tree.
//!
//! The classification itself is a pure function over a captured pane
//! snapshot plus one boolean (assistant process present); the effectful
//! wrapper gathers those inputs from tmux. A single noisy reading must
//! never cause an action on its own; the rule engine's inertia and
//! confirmation guards absorb that.

use crate::patterns::PatternSet;
use crate::proc;
use crate::tmux::Tmux;
use serde::{Deserialize, Serialize};

/// How many pane lines the classifier inspects.
pub const CAPTURE_LINES: u32 = 25;

/// The seven window states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Working,
    Idle,
    IdleLowContext,
    Permission,
    PermissionWithRemember,
    Shell,
    Absent,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Working => "working",
            WindowStatus::Idle => "idle",
            WindowStatus::IdleLowContext => "idle_low_context",
            WindowStatus::Permission => "permission",
            WindowStatus::PermissionWithRemember => "permission_with_remember",
            WindowStatus::Shell => "shell",
            WindowStatus::Absent => "absent",
        }
    }

    /// Exit code for the `classify` CLI helper:
    /// 0=working, 1=idle/permission, 2=shell, 3=absent.
    pub fn exit_code(&self) -> i32 {
        match self {
            WindowStatus::Working => 0,
            WindowStatus::Idle
            | WindowStatus::IdleLowContext
            | WindowStatus::Permission
            | WindowStatus::PermissionWithRemember => 1,
            WindowStatus::Shell => 2,
            WindowStatus::Absent => 3,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WindowStatus::Idle | WindowStatus::IdleLowContext)
    }

    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            WindowStatus::Permission | WindowStatus::PermissionWithRemember
        )
    }
}

/// One classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub status: WindowStatus,
    /// Context-remaining percentage, `-1` for unknown.
    pub context_num: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_limit_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_block_reason: Option<String>,
    /// Activity snippet (working) or prompt line (idle), for logs and
    /// injection verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

impl Observation {
    fn bare(status: WindowStatus) -> Self {
        Self {
            status,
            context_num: -1,
            weekly_limit_pct: None,
            manual_block_reason: None,
            last_activity: None,
        }
    }
}

/// Splits the pane into the activity region (body) by dropping the bottom
/// bar: trailing empty lines, the input box, the prompt line and the status
/// line.
fn activity_region<'a>(lines: &'a [&'a str], pats: &PatternSet) -> &'a [&'a str] {
    let mut end = lines.len();
    while end > 0 {
        let line = lines[end - 1].trim();
        let is_chrome = line.is_empty()
            || pats.is_prompt_line(line)
            || line.starts_with(['╭', '│', '╰', '─'])
            || line.contains("context left")
            || line.contains("tokens");
        if is_chrome {
            end -= 1;
        } else {
            break;
        }
    }
    &lines[..end]
}

/// First word of a bullet line, stripped of trailing punctuation.
fn bullet_word<'a>(line: &'a str, pats: &PatternSet) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix(|c: char| pats.bullet_chars.contains(&c))?;
    let word = rest.split_whitespace().next()?;
    Some(word.trim_end_matches(['.', ':', ',', '…', '!']).trim_end_matches("..."))
}

fn is_verb_shaped(word: &str, pats: &PatternSet) -> bool {
    if pats.irregular_verbs.iter().any(|v| v == word) {
        return true;
    }
    // Suffix families of rendered activity verbs ("Running", "Compiled",
    // "Wrote", ...). The bare "-d" covers "-ed" and friends.
    word.len() > 3
        && (word.ends_with("ing")
            || word.ends_with("ed")
            || word.ends_with("te")
            || word.ends_with("ote")
            || word.ends_with('d'))
}

/// Detects a working-activity line in the body region.
///
/// Accepted shapes: a bullet-verb line; a standalone bullet verb whose next
/// line is a tree child (`└`); or one of the whole working phrases. The
/// animated "Thinking" spinner sometimes emits a bare verb with only the
/// tree child following. Missing that shape over-nudges a busy assistant.
fn find_working_activity<'a>(region: &[&'a str], pats: &PatternSet) -> Option<&'a str> {
    for phrase in &pats.working_phrases {
        if let Some(line) = region.iter().find(|l| l.contains(phrase.as_str())) {
            return Some(line);
        }
    }
    for (i, line) in region.iter().enumerate() {
        let Some(word) = bullet_word(line, pats) else {
            continue;
        };
        if is_verb_shaped(word, pats) {
            return Some(line);
        }
        // Standalone verb: single word on the bullet line, tree child below.
        let rest_is_bare = line
            .trim_start()
            .trim_start_matches(|c: char| pats.bullet_chars.contains(&c))
            .split_whitespace()
            .count()
            == 1;
        let next_is_tree_child = region
            .get(i + 1)
            .is_some_and(|n| n.trim_start().starts_with('└'));
        if rest_is_bare && next_is_tree_child && word.chars().next().is_some_and(char::is_uppercase)
        {
            return Some(line);
        }
    }
    None
}

/// Pure classification of a pane snapshot (steps 3–4 of the protocol).
/// `low_context_threshold` is inclusive: a context percentage equal to the
/// threshold classifies as low.
pub fn classify_pane(
    pane: &str,
    pats: &PatternSet,
    low_context_threshold: i64,
) -> Observation {
    let lines: Vec<&str> = pane.lines().collect();
    let context_num = pats.context_percent(pane);
    let weekly_limit_pct = pats.weekly_limit_percent(pane);
    let manual_block_reason = pats.manual_block_reason(pane);

    let mut obs = Observation {
        status: WindowStatus::Idle,
        context_num,
        weekly_limit_pct,
        manual_block_reason,
        last_activity: None,
    };

    if let Some(line) = lines.iter().find(|l| l.contains("esc to interrupt")) {
        obs.status = WindowStatus::Working;
        obs.last_activity = Some(line.trim().to_string());
        return obs;
    }

    let region = activity_region(&lines, pats);
    if let Some(line) = find_working_activity(region, pats) {
        obs.status = WindowStatus::Working;
        obs.last_activity = Some(line.trim().to_string());
        return obs;
    }

    let region_text = region.join("\n");
    if pats
        .permission_cues
        .iter()
        .any(|c| region_text.contains(c.as_str()))
    {
        let remember = pats
            .remember_cues
            .iter()
            .any(|c| region_text.contains(c.as_str()));
        obs.status = if remember {
            WindowStatus::PermissionWithRemember
        } else {
            WindowStatus::Permission
        };
        return obs;
    }

    if (1..=low_context_threshold).contains(&context_num) {
        obs.status = WindowStatus::IdleLowContext;
    }
    obs.last_activity = lines
        .iter()
        .rev()
        .find(|l| pats.is_prompt_line(l))
        .map(|l| l.trim().to_string());
    obs
}

/// Whether the pane tail carries TUI-characteristic markers, the fallback
/// when the process-tree walk is inconclusive (e.g. right after a
/// compaction the screen is sparse but the TUI is alive).
pub fn pane_has_tui_markers(pane: &str, pats: &PatternSet) -> bool {
    let tail: Vec<&str> = pane.lines().rev().take(8).collect();
    tail.iter().any(|l| {
        l.contains("context left") || l.contains("esc to interrupt") || pats.is_prompt_line(l)
    })
}

/// The effectful classifier: gathers tmux + process-tree inputs and runs
/// [`classify_pane`].
#[derive(Debug, Clone)]
pub struct Classifier {
    tmux: Tmux,
    pats: PatternSet,
    low_context_threshold: i64,
}

impl Classifier {
    pub fn new(tmux: Tmux, pats: PatternSet, low_context_threshold: i64) -> Self {
        Self {
            tmux,
            pats,
            low_context_threshold,
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.pats
    }

    /// Classifies one window. Never errors: transport problems read as
    /// `absent` (the window cannot be observed, so nothing may act on it).
    pub async fn observe(&self, window: &str) -> Observation {
        if !self.tmux.has_session().await || !self.tmux.has_window(window).await {
            return Observation::bare(WindowStatus::Absent);
        }

        let pane = match self.tmux.capture_pane(window, CAPTURE_LINES).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(window, error = %e, "pane capture failed");
                return Observation::bare(WindowStatus::Absent);
            }
        };

        if !self.assistant_running(window, &pane).await {
            let mut obs = Observation::bare(WindowStatus::Shell);
            obs.manual_block_reason = self.pats.manual_block_reason(&pane);
            return obs;
        }

        classify_pane(&pane, &self.pats, self.low_context_threshold)
    }

    /// True when the assistant process is alive in the pane's subtree, with
    /// the pane-marker fallback when the walk is inconclusive.
    pub async fn assistant_running(&self, window: &str, pane: &str) -> bool {
        let needles: Vec<&str> = self
            .pats
            .assistant_process_needles
            .iter()
            .map(String::as_str)
            .collect();
        if let Ok(Some(root)) = self.tmux.pane_pid(window).await {
            if proc::find_in_subtree(root, &needles).is_some() {
                return true;
            }
        }
        pane_has_tui_markers(pane, &self.pats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats() -> PatternSet {
        PatternSet::default()
    }

    fn classify(pane: &str) -> Observation {
        classify_pane(pane, &pats(), 25)
    }

    #[test]
    fn test_esc_to_interrupt_is_working() {
        let obs = classify("some output\n· Compiling… (esc to interrupt)\n❯ \n");
        assert_eq!(obs.status, WindowStatus::Working);
        assert!(obs.last_activity.unwrap().contains("Compiling"));
    }

    #[test]
    fn test_bullet_verb_suffix_is_working() {
        let obs = classify("• Running tests\n\n❯ \n62% context left\n");
        assert_eq!(obs.status, WindowStatus::Working);
    }

    #[test]
    fn test_irregular_verb_is_working() {
        let obs = classify("• Wrote src/main.rs\n\n❯ \n");
        assert_eq!(obs.status, WindowStatus::Working);
    }

    #[test]
    fn test_standalone_verb_with_tree_child_is_working() {
        let pane = "• Search\n  └ pattern: TODO\n\n❯ \n";
        assert_eq!(classify(pane).status, WindowStatus::Working);
    }

    #[test]
    fn test_standalone_word_without_tree_child_is_idle() {
        let pane = "• Search\nnothing below\n\n❯ \n";
        assert_eq!(classify(pane).status, WindowStatus::Idle);
    }

    #[test]
    fn test_context_compacted_phrase_is_working() {
        let pane = "Context compacted\n\n❯ \n85% context left\n";
        let obs = classify(pane);
        assert_eq!(obs.status, WindowStatus::Working);
        assert_eq!(obs.context_num, 85);
    }

    #[test]
    fn test_permission_dialog() {
        let pane = "Run `cargo test`?\n  Yes, proceed\n  Esc to cancel\n";
        assert_eq!(classify(pane).status, WindowStatus::Permission);
    }

    #[test]
    fn test_permission_with_remember() {
        let pane = "Run `cargo test`?\n  Allow once\n  Allow always\n  Esc to cancel\n";
        assert_eq!(classify(pane).status, WindowStatus::PermissionWithRemember);
    }

    #[test]
    fn test_permission_cue_in_bottom_bar_ignored() {
        // Cue text sitting inside the input box must not read as a dialog.
        let pane = "done with task\n\n│ Press enter to confirm │\n❯ \n";
        assert_eq!(classify(pane).status, WindowStatus::Idle);
    }

    #[test]
    fn test_low_context_at_threshold() {
        let pane = "finished\n\n❯ \n25% context left\n";
        let obs = classify(pane);
        assert_eq!(obs.status, WindowStatus::IdleLowContext);
        assert_eq!(obs.context_num, 25);
    }

    #[test]
    fn test_just_above_threshold_is_idle() {
        let pane = "finished\n\n❯ \n26% context left\n";
        assert_eq!(classify(pane).status, WindowStatus::Idle);
    }

    #[test]
    fn test_zero_context_is_unknown_and_idle() {
        let pane = "finished\n\n❯ \n0% context left\n";
        let obs = classify(pane);
        assert_eq!(obs.status, WindowStatus::Idle);
        assert_eq!(obs.context_num, -1);
    }

    #[test]
    fn test_classification_is_pure() {
        let pane = "• Running tests\n\n❯ \n62% context left\n";
        let a = classify(pane);
        let b = classify(pane);
        assert_eq!(a.status, b.status);
        assert_eq!(a.context_num, b.context_num);
    }

    #[test]
    fn test_status_output_domain() {
        // Every output must be one of the seven states, context in
        // {-1} ∪ [0,100].
        for pane in [
            "",
            "random text",
            "• Running\n",
            "120% context left\n",
            "Allow once\n",
        ] {
            let obs = classify(pane);
            assert!(obs.context_num == -1 || (0..=100).contains(&obs.context_num));
            let _ = obs.status.as_str();
        }
    }

    #[test]
    fn test_weekly_limit_extracted() {
        let pane = "finished\nWeekly limit: 3% left\n❯ \n";
        assert_eq!(classify(pane).weekly_limit_pct, Some(3));
    }

    #[test]
    fn test_manual_block_reason_extracted() {
        let pane = "Waiting for signing certificate from keychain\n❯ \n";
        let obs = classify(pane);
        assert!(obs.manual_block_reason.unwrap().contains("certificate"));
    }

    #[test]
    fn test_pane_tui_markers() {
        assert!(pane_has_tui_markers("❯ \n", &pats()));
        assert!(pane_has_tui_markers("x\n42% context left\n", &pats()));
        assert!(!pane_has_tui_markers("user@host:~$ ls\n", &pats()));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WindowStatus::Working.exit_code(), 0);
        assert_eq!(WindowStatus::Idle.exit_code(), 1);
        assert_eq!(WindowStatus::PermissionWithRemember.exit_code(), 1);
        assert_eq!(WindowStatus::Shell.exit_code(), 2);
        assert_eq!(WindowStatus::Absent.exit_code(), 3);
    }
}
