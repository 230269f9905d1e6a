//! Reliable delivery of one logical message into the assistant's input box.
//!
//! Three escalating strategies (direct keystrokes, chunked keystrokes,
//! bracketed paste), guarded by pane-membership checks (an injector that
//! writes into a bare shell would execute attacker-controlled text as a
//! command), followed by post-send verification against a fresh pane
//! capture.

use crate::classifier::pane_has_tui_markers;
use crate::lockfile;
use crate::paths::{sanitize_window, StatePaths};
use crate::patterns::PatternSet;
use crate::proc;
use crate::state_store;
use crate::tmux::{Tmux, TmuxError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Message-size thresholds selecting the strategy.
const DIRECT_MAX: usize = 300;
const CHUNKED_MAX: usize = 800;
/// Keystroke chunk size for the chunked strategy.
const CHUNK_CHARS: usize = 100;
/// How many leading characters of the message the verifier looks for.
const VERIFY_PREFIX_CHARS: usize = 24;
/// Injector lock staleness; sends are short.
const SEND_LOCK_STALE: Duration = Duration::from_secs(10);

static BUFFER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("no_session")]
    NoSession,

    #[error("no_window")]
    NoWindow,

    #[error("no_assistant")]
    NoAssistant,

    #[error("lock_busy")]
    LockBusy,

    #[error("verify_failed")]
    VerifyFailed,

    #[error("tmux: {0}")]
    Tmux(#[from] TmuxError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strategy {
    Direct,
    Chunked,
    Paste,
}

impl Strategy {
    pub fn for_len(chars: usize) -> Self {
        if chars <= DIRECT_MAX {
            Strategy::Direct
        } else if chars <= CHUNKED_MAX {
            Strategy::Chunked
        } else {
            Strategy::Paste
        }
    }

    fn escalate(self) -> Self {
        match self {
            Strategy::Direct => Strategy::Chunked,
            Strategy::Chunked | Strategy::Paste => Strategy::Paste,
        }
    }
}

/// Splits text into fixed-size character chunks.
fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Collapses a message to the single line the TUI input accepts for
/// keystroke strategies.
fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ").trim().to_string()
}

/// Last prompt-glyph line of a pane, trimmed.
fn prompt_line(pane: &str, pats: &PatternSet) -> Option<String> {
    pane.lines()
        .rev()
        .find(|l| pats.is_prompt_line(l))
        .map(|l| l.trim().to_string())
}

/// Post-send acceptance: message prefix visible in the pane tail, a busy
/// marker (the TUI took the message and ran), or a prompt line that changed
/// into something that is neither empty nor just our own prefix echoed.
fn verification_passed(
    pane: &str,
    pre_prompt: Option<&str>,
    message: &str,
    pats: &PatternSet,
) -> bool {
    let prefix: String = single_line(message)
        .chars()
        .take(VERIFY_PREFIX_CHARS)
        .collect();
    let tail: String = {
        let lines: Vec<&str> = pane.lines().collect();
        let start = lines.len().saturating_sub(8);
        lines[start..].join("\n")
    };
    if !prefix.is_empty() && tail.contains(&prefix) {
        return true;
    }
    if pats.has_busy_marker(pane) {
        return true;
    }
    if let Some(now) = prompt_line(pane, pats) {
        let glyph_only = now.trim_start_matches(pats.prompt_glyph).trim();
        let changed = pre_prompt.map_or(true, |pre| pre != now);
        if changed && !glyph_only.is_empty() && !prefix.starts_with(glyph_only) {
            return true;
        }
    }
    false
}

/// The injection channel for one tmux session.
#[derive(Debug, Clone)]
pub struct Injector {
    tmux: Tmux,
    pats: PatternSet,
    paths: StatePaths,
}

impl Injector {
    pub fn new(tmux: Tmux, pats: PatternSet, paths: StatePaths) -> Self {
        Self { tmux, pats, paths }
    }

    /// Delivers `text` into `window` and submits it.
    ///
    /// On success a manual-task timestamp is written for the window so the
    /// rule engine leaves the assistant a grace period before re-nudging;
    /// human and automated senders must never fight over the input box.
    pub async fn inject(&self, window: &str, text: &str) -> Result<(), InjectError> {
        if !self.tmux.has_session().await {
            return Err(InjectError::NoSession);
        }
        if !self.tmux.has_window(window).await {
            return Err(InjectError::NoWindow);
        }

        let pre_pane = self.tmux.capture_pane(window, 15).await?;
        if !self.assistant_running(window, &pre_pane).await {
            return Err(InjectError::NoAssistant);
        }

        let lock_path = self.paths.send_lock(window);
        let Some(_lock) = lockfile::try_acquire(&lock_path, SEND_LOCK_STALE)? else {
            return Err(InjectError::LockBusy);
        };

        let pre_prompt = prompt_line(&pre_pane, &self.pats);
        let mut strategy = Strategy::for_len(text.chars().count());

        // At most two strategies per call.
        for attempt in 0..2 {
            self.send_with(window, text, strategy).await?;

            if self.verify(window, &pre_prompt, text).await? {
                state_store::touch(&self.paths.manual_task(window))?;
                tracing::info!(window, strategy = ?strategy, chars = text.chars().count(), "injected");
                return Ok(());
            }

            // Re-observe before crediting a failure: verification may have
            // lost the race to a fast-starting turn.
            let pane = self.tmux.capture_pane(window, 15).await?;
            if self.pats.has_busy_marker(&pane) {
                state_store::touch(&self.paths.manual_task(window))?;
                tracing::info!(window, strategy = ?strategy, "injected (late busy marker)");
                return Ok(());
            }

            if attempt == 0 {
                let next = strategy.escalate();
                tracing::warn!(window, from = ?strategy, to = ?next, "send verification failed, escalating");
                strategy = next;
            }
        }

        Err(InjectError::VerifyFailed)
    }

    /// Sends a bare key sequence (permission approvals) with the same
    /// membership checks but no content verification.
    pub async fn press(&self, window: &str, key: &str) -> Result<(), InjectError> {
        if !self.tmux.has_session().await {
            return Err(InjectError::NoSession);
        }
        if !self.tmux.has_window(window).await {
            return Err(InjectError::NoWindow);
        }
        let pane = self.tmux.capture_pane(window, 15).await?;
        if !self.assistant_running(window, &pane).await {
            return Err(InjectError::NoAssistant);
        }
        let lock_path = self.paths.send_lock(window);
        let Some(_lock) = lockfile::try_acquire(&lock_path, SEND_LOCK_STALE)? else {
            return Err(InjectError::LockBusy);
        };
        self.tmux.send_literal(window, key).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.tmux.send_key(window, "Enter").await?;
        Ok(())
    }

    async fn assistant_running(&self, window: &str, pane: &str) -> bool {
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

    async fn send_with(
        &self,
        window: &str,
        text: &str,
        strategy: Strategy,
    ) -> Result<(), InjectError> {
        match strategy {
            Strategy::Direct => {
                self.tmux.send_literal(window, &single_line(text)).await?;
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            Strategy::Chunked => {
                for chunk in chunk_chars(&single_line(text), CHUNK_CHARS) {
                    self.tmux.send_literal(window, &chunk).await?;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
            Strategy::Paste => {
                // Buffer names must be unique across concurrent sends.
                let seq = BUFFER_SEQ.fetch_add(1, Ordering::Relaxed);
                let name = format!(
                    "autopilot-{}-{}-{}",
                    sanitize_window(window),
                    std::process::id(),
                    seq
                );
                let tmp = std::env::temp_dir().join(format!("{name}.txt"));
                std::fs::write(&tmp, text)?;
                let loaded = self.tmux.load_buffer(&name, &tmp).await;
                let _ = std::fs::remove_file(&tmp);
                loaded?;
                let pasted = self.tmux.paste_buffer(&name, window).await;
                self.tmux.delete_buffer(&name).await;
                pasted?;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        self.tmux.send_key(window, "Enter").await?;
        Ok(())
    }

    /// Two-phase verification: capture at ~0.5 s, then again at ~1 s.
    async fn verify(
        &self,
        window: &str,
        pre_prompt: &Option<String>,
        text: &str,
    ) -> Result<bool, InjectError> {
        for delay in [Duration::from_millis(500), Duration::from_millis(500)] {
            tokio::time::sleep(delay).await;
            let pane = self.tmux.capture_pane(window, 15).await?;
            if verification_passed(&pane, pre_prompt.as_deref(), text, &self.pats) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
