//! External command execution with hard wall-clock timeouts.
//!
//! Every collaborator invocation (tmux, git, type checker, test runner)
//! goes through here; a hung child is killed at the deadline instead of
//! wedging the tick loop.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{bin}: not found or failed to spawn: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{bin}: timeout({secs}s)")]
    Timeout { bin: String, secs: u64 },

    #[error("{bin}: exit {code}: {stderr}")]
    Failed {
        bin: String,
        code: i32,
        stderr: String,
    },
}

/// Completed command output, stdout/stderr lossily decoded.
#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `bin args...` to completion within `timeout`, failing on non-zero
/// exit. The child is killed when the deadline passes.
pub async fn run(
    bin: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CmdOutput, ExecError> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| ExecError::Spawn {
        bin: bin.to_string(),
        source: e,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return Err(ExecError::Spawn {
                bin: bin.to_string(),
                source: e,
            });
        }
        Err(_) => {
            return Err(ExecError::Timeout {
                bin: bin.to_string(),
                secs: timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(ExecError::Failed {
            bin: bin.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.lines().next().unwrap_or("").to_string(),
        });
    }
    Ok(CmdOutput { stdout, stderr })
}

/// Like [`run`] but treats any failure (including non-zero exit) as `None`.
/// For probes where absence of output is an answer, not an error.
pub async fn run_ok(
    bin: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Option<CmdOutput> {
    run(bin, args, cwd, timeout).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", &["hello"], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_error() {
        let err = run("false", &[], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        let err = run(
            "definitely-not-a-binary-xyz",
            &[],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let err = run("sleep", &["30"], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            ExecError::Timeout { bin, .. } => assert_eq!(bin, "sleep"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_ok_swallows_failure() {
        assert!(run_ok("false", &[], None, Duration::from_secs(5))
            .await
            .is_none());
    }
}
