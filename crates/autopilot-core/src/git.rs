//! Git plumbing for commit detection and review ranges.
//!
//! Plumbing only (`rev-parse`, `rev-list`, `log`, `diff --name-only`,
//! `status --porcelain`), and every invocation carries a short timeout.

use crate::exec::{self, ExecError};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

async fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let out = exec::run("git", args, Some(dir), GIT_TIMEOUT).await?;
    Ok(out.stdout)
}

/// Current HEAD hash, full length. `None` for an empty repository.
pub async fn head(dir: &Path) -> Result<Option<String>, GitError> {
    match git(dir, &["rev-parse", "HEAD"]).await {
        Ok(out) => Ok(Some(out.trim().to_string())),
        Err(GitError::Exec(ExecError::Failed { stderr, .. }))
            if stderr.contains("unknown revision") || stderr.contains("ambiguous argument") =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub fn short(hash: &str) -> &str {
    &hash[..hash.len().min(7)]
}

/// Subject line of HEAD.
pub async fn head_subject(dir: &Path) -> Result<String, GitError> {
    Ok(git(dir, &["log", "-1", "--format=%s"]).await?.trim().to_string())
}

/// Unix commit time of HEAD.
pub async fn head_commit_time(dir: &Path) -> Result<u64, GitError> {
    Ok(git(dir, &["log", "-1", "--format=%ct"])
        .await?
        .trim()
        .parse()
        .unwrap_or(0))
}

/// Number of commits in `old..new`.
pub async fn rev_list_count(dir: &Path, old: &str, new: &str) -> Result<u64, GitError> {
    let range = format!("{old}..{new}");
    Ok(git(dir, &["rev-list", &range, "--count"])
        .await?
        .trim()
        .parse()
        .unwrap_or(0))
}

/// Number of commits in the last `minutes` minutes.
pub async fn commits_since_minutes(dir: &Path, minutes: u64) -> Result<u64, GitError> {
    let since = format!("--since={minutes} minutes ago");
    Ok(git(dir, &["rev-list", "HEAD", &since, "--count"])
        .await?
        .trim()
        .parse()
        .unwrap_or(0))
}

/// Files changed across `range` (e.g. `abc..def`).
pub async fn changed_files(dir: &Path, range: &str) -> Result<Vec<String>, GitError> {
    let out = git(dir, &["diff", "--name-only", range, "--"]).await?;
    Ok(out
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Last `n` commit subjects, newest first.
pub async fn recent_subjects(dir: &Path, n: u32) -> Result<Vec<String>, GitError> {
    let count = format!("-{n}");
    let out = git(dir, &["log", &count, "--format=%s"]).await?;
    Ok(out
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Paths with uncommitted changes (`status --porcelain`, path column).
pub async fn uncommitted_files(dir: &Path) -> Result<Vec<String>, GitError> {
    let out = git(dir, &["status", "--porcelain"]).await?;
    Ok(out
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| l[3..].trim().to_string())
        .collect())
}

/// Conventional-commit type prefix of a subject (`feat`, `fix`, ...).
pub fn commit_type(subject: &str) -> Option<&str> {
    let head = subject.split(':').next()?;
    let bare = head.trim_end_matches(|c: char| c == '!' || c == ')');
    let bare = bare.split('(').next()?;
    match bare {
        "feat" | "fix" | "chore" | "docs" | "refactor" | "test" | "perf" | "build" | "ci"
        | "style" => Some(bare),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "test@test.local"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
        }
        commit(dir, "README.md", "# Test", "chore: initial commit");
    }

    fn commit(dir: &Path, file: &str, content: &str, msg: &str) {
        std::fs::write(dir.join(file), content).unwrap();
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", msg])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[tokio::test]
    async fn test_head_and_subject() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let h = head(tmp.path()).await.unwrap().unwrap();
        assert_eq!(h.len(), 40);
        assert_eq!(
            head_subject(tmp.path()).await.unwrap(),
            "chore: initial commit"
        );
    }

    #[tokio::test]
    async fn test_rev_list_count_and_changed_files() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let old = head(tmp.path()).await.unwrap().unwrap();
        commit(tmp.path(), "a.rs", "fn a() {}", "feat: add a");
        commit(tmp.path(), "b.rs", "fn b() {}", "feat: add b");
        let new = head(tmp.path()).await.unwrap().unwrap();

        assert_eq!(rev_list_count(tmp.path(), &old, &new).await.unwrap(), 2);
        let files = changed_files(tmp.path(), &format!("{old}..{new}")).await.unwrap();
        assert_eq!(files, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_recent_subjects_newest_first() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        commit(tmp.path(), "a.rs", "x", "feat: one");
        commit(tmp.path(), "b.rs", "y", "fix: two");
        let subjects = recent_subjects(tmp.path(), 2).await.unwrap();
        assert_eq!(subjects, vec!["fix: two".to_string(), "feat: one".to_string()]);
    }

    #[tokio::test]
    async fn test_uncommitted_files() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        assert!(uncommitted_files(tmp.path()).await.unwrap().is_empty());
        std::fs::write(tmp.path().join("dirty.rs"), "x").unwrap();
        let files = uncommitted_files(tmp.path()).await.unwrap();
        assert_eq!(files, vec!["dirty.rs".to_string()]);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("abcdef0123456789"), "abcdef0");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_commit_type() {
        assert_eq!(commit_type("feat: add parser"), Some("feat"));
        assert_eq!(commit_type("fix(core): handle nil"), Some("fix"));
        assert_eq!(commit_type("feat!: breaking"), Some("feat"));
        assert_eq!(commit_type("update stuff"), None);
    }
}
