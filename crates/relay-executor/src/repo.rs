//! Repository preparation for a worker's isolated working directory
//! (spec.md §4.4 step 3) and the post-execution apply-check (step 6).
//!
//! Generalized from this codebase's synchronous `abp-git::{ensure_git_repo,
//! run_git}` helpers, switched to `tokio::process::Command` so the Worker
//! Pool's lease-heartbeat loop keeps running while git does its I/O.

use relay_core::RepoRef;
use relay_error::{ErrorCode, RelayError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Clone and check out a job's baseline commit into `work_dir`.
///
/// `repo.type == "local"` is rejected here too as a defense-in-depth
/// backstop; the Job Manager already refuses it at `submit` time.
pub async fn prepare_repo(repo: &RepoRef, work_dir: &Path) -> Result<()> {
    match repo.repo_type.as_str() {
        "git" => prepare_git_repo(repo, work_dir).await,
        "local" => Err(RelayError::new(
            ErrorCode::Policy,
            "repo.type==\"local\" is not supported; submit a git clone url",
        )),
        other => Err(RelayError::new(
            ErrorCode::Policy,
            format!("unsupported repo.type {other:?}"),
        )),
    }
}

async fn prepare_git_repo(repo: &RepoRef, work_dir: &Path) -> Result<()> {
    let url = repo.url.as_deref().ok_or_else(|| {
        RelayError::new(ErrorCode::ExecutorError, "repo.type==\"git\" requires repo.url")
    })?;
    run_git(&["clone", "--quiet", url, "."], work_dir).await?;
    run_git(&["checkout", "--quiet", repo.baseline_commit.as_str()], work_dir).await?;
    Ok(())
}

async fn run_git(args: &[&str], cwd: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| {
            RelayError::new(ErrorCode::ExecutorError, format!("failed to run git {args:?}")).with_source(e)
        })?;
    if !output.status.success() {
        return Err(RelayError::new(ErrorCode::ExecutorError, format!("git {args:?} failed"))
            .with_context("stderr", String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(())
}

/// Verify a diff applies cleanly against the prepared working directory
/// (spec.md §4.4 step 6, `reason_code=CONFLICT` on failure).
pub async fn apply_check(diff: &str, work_dir: &Path) -> Result<bool> {
    if diff.trim().is_empty() {
        return Ok(true);
    }
    let mut child = Command::new("git")
        .args(["apply", "--check", "-"])
        .current_dir(work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            RelayError::new(ErrorCode::ExecutorError, "failed to spawn git apply --check").with_source(e)
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(diff.as_bytes()).await;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| RelayError::new(ErrorCode::ExecutorError, "git apply --check failed to run").with_source(e))?;
    Ok(output.status.success())
}

/// Extract the set of paths a unified diff touches, reading the `+++ b/`
/// headers — used to enforce `ScopeSpec.file_globs` against what the
/// executor actually wrote (spec.md §4.4's scope enforcement).
#[must_use]
pub fn touched_paths(diff: &str) -> Vec<String> {
    diff.lines()
        .filter_map(|line| line.strip_prefix("+++ "))
        .filter_map(|rest| rest.strip_prefix("b/"))
        .filter(|path| *path != "/dev/null")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touched_paths_reads_plus_plus_plus_headers() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+new\n";
        assert_eq!(touched_paths(diff), vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn touched_paths_skips_dev_null() {
        let diff = "--- /dev/null\n+++ /dev/null\n";
        assert!(touched_paths(diff).is_empty());
    }

    #[tokio::test]
    async fn empty_diff_always_applies() {
        let dir = tempfile::tempdir().unwrap();
        assert!(apply_check("", dir.path()).await.unwrap());
    }
}
