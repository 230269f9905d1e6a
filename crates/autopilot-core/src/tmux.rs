//! Thin tmux wrapper covering exactly the surface the supervisor needs:
//! session/window existence, pane capture, pane root PIDs, key injection
//! and named buffers for bracketed paste. One session, one window per
//! project.
//!
//! Every invocation carries a short timeout; tmux wedging must not wedge
//! the tick loop.

use crate::exec::{self, ExecError};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux session '{0}' does not exist")]
    NoSession(String),

    #[error("window '{0}' not found")]
    NoWindow(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Handle to one tmux session.
#[derive(Debug, Clone)]
pub struct Tmux {
    bin: String,
    session: String,
}

impl Tmux {
    pub fn new(bin: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn target(&self, window: &str) -> String {
        format!("{}:{}", self.session, window)
    }

    pub async fn has_session(&self) -> bool {
        exec::run_ok(
            &self.bin,
            &["has-session", "-t", &self.session],
            None,
            TMUX_TIMEOUT,
        )
        .await
        .is_some()
    }

    pub async fn list_windows(&self) -> Result<Vec<String>, TmuxError> {
        let out = exec::run(
            &self.bin,
            &["list-windows", "-t", &self.session, "-F", "#{window_name}"],
            None,
            TMUX_TIMEOUT,
        )
        .await
        .map_err(|_| TmuxError::NoSession(self.session.clone()))?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn has_window(&self, window: &str) -> bool {
        self.list_windows()
            .await
            .map(|ws| ws.iter().any(|w| w == window))
            .unwrap_or(false)
    }

    /// Captures the last `lines` lines of the window's pane.
    pub async fn capture_pane(&self, window: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        let target = self.target(window);
        let out = exec::run(
            &self.bin,
            &["capture-pane", "-t", &target, "-p", "-S", &start],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(out.stdout)
    }

    /// Root PID of the window's first pane (the shell that owns the pane).
    pub async fn pane_pid(&self, window: &str) -> Result<Option<u32>, TmuxError> {
        let target = self.target(window);
        let out = exec::run(
            &self.bin,
            &["list-panes", "-t", &target, "-F", "#{pane_pid}"],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(out
            .stdout
            .lines()
            .next()
            .and_then(|l| l.trim().parse().ok()))
    }

    /// Sends literal text (no key-name interpretation).
    pub async fn send_literal(&self, window: &str, text: &str) -> Result<(), TmuxError> {
        let target = self.target(window);
        exec::run(
            &self.bin,
            &["send-keys", "-t", &target, "-l", text],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Sends a named key (e.g. `Enter`).
    pub async fn send_key(&self, window: &str, key: &str) -> Result<(), TmuxError> {
        let target = self.target(window);
        exec::run(
            &self.bin,
            &["send-keys", "-t", &target, key],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn load_buffer(&self, name: &str, file: &Path) -> Result<(), TmuxError> {
        let file_str = file.to_string_lossy();
        exec::run(
            &self.bin,
            &["load-buffer", "-b", name, &file_str],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Pastes a named buffer with bracketed-paste markers.
    pub async fn paste_buffer(&self, name: &str, window: &str) -> Result<(), TmuxError> {
        let target = self.target(window);
        exec::run(
            &self.bin,
            &["paste-buffer", "-p", "-b", name, "-t", &target],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_buffer(&self, name: &str) {
        let _ = exec::run_ok(
            &self.bin,
            &["delete-buffer", "-b", name],
            None,
            TMUX_TIMEOUT,
        )
        .await;
    }

    /// Creates the session detached with a first window.
    pub async fn new_session(&self, window: &str, dir: &Path) -> Result<(), TmuxError> {
        let dir_str = dir.to_string_lossy();
        exec::run(
            &self.bin,
            &[
                "new-session",
                "-d",
                "-s",
                &self.session,
                "-n",
                window,
                "-c",
                &dir_str,
            ],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn new_window(&self, window: &str, dir: &Path) -> Result<(), TmuxError> {
        let dir_str = dir.to_string_lossy();
        exec::run(
            &self.bin,
            &[
                "new-window",
                "-t",
                &self.session,
                "-n",
                window,
                "-c",
                &dir_str,
            ],
            None,
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_format() {
        let tmux = Tmux::new("tmux", "autopilot");
        assert_eq!(tmux.target("web"), "autopilot:web");
    }

    #[tokio::test]
    async fn test_missing_session_is_absent() {
        // A session name nobody would create; tmux may not even be
        // installed here, which must read the same way.
        let tmux = Tmux::new("tmux", "autopilot-test-no-such-session");
        assert!(!tmux.has_session().await);
    }

    #[tokio::test]
    async fn test_list_windows_without_session_errors() {
        let tmux = Tmux::new("tmux", "autopilot-test-no-such-session");
        assert!(tmux.list_windows().await.is_err());
    }
}
