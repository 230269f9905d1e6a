//! The assistant-TUI pattern set, gathered in one place.
//!
//! TUI strings evolve; every surface pattern the classifier matches lives
//! in this struct so deployments can override them from configuration
//! instead of patching code paths.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static CONTEXT_LEFT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})%\s+context\s+left").unwrap());

static WEEKLY_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:weekly limit|usage|quota)\D{0,20}(\d{1,3})%").unwrap());

/// Optional overrides loaded from configuration; unset fields keep the
/// built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatternOverrides {
    pub manual_block: Option<String>,
    pub busy_markers: Option<Vec<String>>,
    pub permission_cues: Option<Vec<String>>,
    pub remember_cues: Option<Vec<String>>,
    pub working_phrases: Option<Vec<String>>,
}

/// All surface patterns the classifier and injector consult.
#[derive(Debug, Clone)]
pub struct PatternSet {
    /// Regex extracting a manual-block reason from pane text.
    pub manual_block: Regex,
    /// Markers that mean the TUI is actively running.
    pub busy_markers: Vec<String>,
    /// Cues of a permission-confirmation dialog.
    pub permission_cues: Vec<String>,
    /// Extra cues meaning the dialog has a persistent-grant option.
    pub remember_cues: Vec<String>,
    /// Whole phrases that count as working activity in the pane body.
    pub working_phrases: Vec<String>,
    /// Irregular verbs that pass the bullet-verb check without a suffix.
    pub irregular_verbs: Vec<String>,
    /// First character of the input prompt line.
    pub prompt_glyph: char,
    /// Characters accepted as activity bullets.
    pub bullet_chars: Vec<char>,
    /// Command-name needles identifying the assistant in a process tree.
    pub assistant_process_needles: Vec<String>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            manual_block: Regex::new(r"(?i)(certificate|signing|manual step|BLOCKED)").unwrap(),
            busy_markers: vec![
                "esc to interrupt".to_string(),
                "Working".to_string(),
                "Thinking".to_string(),
            ],
            permission_cues: vec![
                "Yes, proceed".to_string(),
                "Press enter to confirm".to_string(),
                "Allow once".to_string(),
                "Esc to cancel".to_string(),
            ],
            remember_cues: vec![
                "don't ask again".to_string(),
                "Allow always".to_string(),
            ],
            working_phrases: vec![
                "Context compacted".to_string(),
                "Waiting for background".to_string(),
                "Compacting context".to_string(),
            ],
            irregular_verbs: [
                "Read", "Ran", "Wrote", "Built", "Made", "Found", "Did", "Got", "Saw", "Thought",
                "Kept", "Sent", "Set", "Put", "Took", "Went", "Held", "Left", "Began", "Chose",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            prompt_glyph: '❯',
            bullet_chars: vec!['•', '●', '·', '∙', '⏺', '✢', '✻'],
            assistant_process_needles: vec!["codex".to_string()],
        }
    }
}

impl PatternSet {
    pub fn with_overrides(overrides: &PatternOverrides) -> Self {
        let mut pats = Self::default();
        if let Some(re) = &overrides.manual_block {
            if let Ok(compiled) = Regex::new(re) {
                pats.manual_block = compiled;
            } else {
                tracing::warn!(pattern = %re, "invalid manual_block override, keeping default");
            }
        }
        if let Some(v) = &overrides.busy_markers {
            pats.busy_markers = v.clone();
        }
        if let Some(v) = &overrides.permission_cues {
            pats.permission_cues = v.clone();
        }
        if let Some(v) = &overrides.remember_cues {
            pats.remember_cues = v.clone();
        }
        if let Some(v) = &overrides.working_phrases {
            pats.working_phrases = v.clone();
        }
        pats
    }

    /// Last `N% context left` occurrence in the pane, if any. 0 reads as
    /// unknown (the TUI shows 0% transiently while recounting).
    pub fn context_percent(&self, pane: &str) -> i64 {
        let last = CONTEXT_LEFT
            .captures_iter(pane)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().parse::<i64>().ok())
            .last();
        match last {
            Some(p) if (1..=100).contains(&p) => p,
            _ => -1,
        }
    }

    /// Weekly usage-limit percentage, if the TUI is surfacing one.
    pub fn weekly_limit_percent(&self, pane: &str) -> Option<u8> {
        WEEKLY_LIMIT
            .captures_iter(pane)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().parse::<u8>().ok())
            .last()
            .filter(|p| *p <= 100)
    }

    /// First line matching the manual-block pattern, trimmed.
    pub fn manual_block_reason(&self, pane: &str) -> Option<String> {
        pane.lines()
            .find(|l| self.manual_block.is_match(l))
            .map(|l| l.trim().to_string())
    }

    pub fn has_busy_marker(&self, text: &str) -> bool {
        self.busy_markers.iter().any(|m| text.contains(m.as_str()))
    }

    pub fn is_prompt_line(&self, line: &str) -> bool {
        line.trim_start().starts_with(self.prompt_glyph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_percent_takes_last() {
        let pats = PatternSet::default();
        let pane = "42% context left\nsome output\n17% context left\n";
        assert_eq!(pats.context_percent(pane), 17);
    }

    #[test]
    fn test_context_percent_zero_is_unknown() {
        let pats = PatternSet::default();
        assert_eq!(pats.context_percent("0% context left"), -1);
    }

    #[test]
    fn test_context_percent_missing() {
        let pats = PatternSet::default();
        assert_eq!(pats.context_percent("no status bar here"), -1);
    }

    #[test]
    fn test_weekly_limit() {
        let pats = PatternSet::default();
        assert_eq!(
            pats.weekly_limit_percent("Weekly limit: 4% remaining"),
            Some(4)
        );
        assert_eq!(pats.weekly_limit_percent("no limits"), None);
    }

    #[test]
    fn test_manual_block_reason() {
        let pats = PatternSet::default();
        let pane = "doing things\nWaiting for certificate approval\nmore";
        assert_eq!(
            pats.manual_block_reason(pane).as_deref(),
            Some("Waiting for certificate approval")
        );
    }

    #[test]
    fn test_override_bad_regex_keeps_default() {
        let overrides = PatternOverrides {
            manual_block: Some("([unclosed".to_string()),
            ..Default::default()
        };
        let pats = PatternSet::with_overrides(&overrides);
        assert!(pats.manual_block.is_match("BLOCKED"));
    }

    #[test]
    fn test_override_busy_markers() {
        let overrides = PatternOverrides {
            busy_markers: Some(vec!["grinding".to_string()]),
            ..Default::default()
        };
        let pats = PatternSet::with_overrides(&overrides);
        assert!(pats.has_busy_marker("grinding away"));
        assert!(!pats.has_busy_marker("esc to interrupt"));
    }
}
