//! The `ExecutorBackend` collaborator: turns a `JobSpec` plus a prepared
//! working directory into the fixed three-part output contract (spec.md
//! §4.4 step 4). [`SubprocessBackend`] is the default implementation,
//! shelling out to an operator-configured command.
//!
//! Generalized from `SidecarClient::spawn`/`run`'s subprocess-handshake
//! pattern: spawn with piped stdio, write the request to stdin, drain
//! stderr to `tracing` in the background, read the result from stdout.

use async_trait::async_trait;
use relay_error::{ErrorCode, RelayError, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::warn;

/// The executor's required output: a unified diff plus the two prose
/// sections every backend must produce alongside it.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    /// Unified diff against the job's baseline commit.
    pub diff: String,
    /// Prose test plan.
    pub test_plan: String,
    /// Free-form notes.
    pub notes: String,
    /// Raw stdout+stderr, preserved verbatim for `logs.txt`.
    pub raw_output: String,
}

/// A pluggable executor backend. The Worker Pool invokes exactly one call
/// per job attempt, inside an already-prepared working directory.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Run the task described by `spec` inside `work_dir`, aborting if it
    /// runs past `timeout_ms`.
    async fn execute(
        &self,
        spec: &relay_core::JobSpec,
        work_dir: &Path,
        timeout_ms: u64,
    ) -> Result<BackendOutput>;
}

/// Default backend: runs a configured command with the `JobSpec` as JSON on
/// stdin, and expects `{"diff", "testPlan", "notes"}` as JSON on stdout.
pub struct SubprocessBackend {
    command: String,
    args: Vec<String>,
}

impl SubprocessBackend {
    /// Build a backend that runs `command` with no extra arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Attach fixed arguments passed before the job spec is piped in.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl ExecutorBackend for SubprocessBackend {
    async fn execute(
        &self,
        spec: &relay_core::JobSpec,
        work_dir: &Path,
        timeout_ms: u64,
    ) -> Result<BackendOutput> {
        let payload = serde_json::to_vec(spec).map_err(|e| {
            RelayError::new(ErrorCode::ExecutorError, "failed to serialize job spec for executor stdin")
                .with_source(e)
        })?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RelayError::new(
                    ErrorCode::ExecutorError,
                    format!("failed to spawn executor command {:?}", self.command),
                )
                .with_source(e)
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| {
                RelayError::new(ErrorCode::ExecutorError, "failed to write job spec to executor stdin")
                    .with_source(e)
            })?;
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let wait = child.wait_with_output();
        let output = tokio::time::timeout(Duration::from_millis(timeout_ms), wait)
            .await
            .map_err(|_| RelayError::new(ErrorCode::Timeout, "executor backend exceeded its configured timeout"))?
            .map_err(|e| RelayError::new(ErrorCode::ExecutorError, "executor process failed").with_source(e))?;

        if !output.status.success() {
            return Err(RelayError::new(
                ErrorCode::ExecutorError,
                format!("executor exited with status {:?}", output.status.code()),
            )
            .with_context("stderr_tail", tail(&output.stderr, 2048)));
        }

        parse_backend_output(&output.stdout)
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(target: "relay_executor::backend", "{line}"),
            Ok(None) => break,
            Err(e) => {
                warn!(target: "relay_executor::backend", error = %e, "stderr pipe read failed");
                break;
            }
        }
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        text.into_owned()
    } else {
        text[text.len() - max..].to_string()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Wire {
    diff: String,
    test_plan: String,
    notes: String,
}

fn parse_backend_output(stdout: &[u8]) -> Result<BackendOutput> {
    let wire: Wire = serde_json::from_slice(stdout).map_err(|e| {
        RelayError::new(
            ErrorCode::BadArtifacts,
            "executor stdout did not parse into {diff, testPlan, notes}",
        )
        .with_source(e)
    })?;
    Ok(BackendOutput {
        diff: wire.diff,
        test_plan: wire.test_plan,
        notes: wire.notes,
        raw_output: String::from_utf8_lossy(stdout).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_output() {
        let stdout = br#"{"diff":"--- a\n+++ b\n","testPlan":"run cargo test","notes":"n/a"}"#;
        let out = parse_backend_output(stdout).unwrap();
        assert_eq!(out.test_plan, "run cargo test");
        assert_eq!(out.notes, "n/a");
    }

    #[test]
    fn rejects_missing_sections() {
        let stdout = br#"{"diff":"x"}"#;
        let err = parse_backend_output(stdout).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadArtifacts);
    }

    #[test]
    fn tail_truncates_from_the_end() {
        let bytes = vec![b'x'; 10];
        assert_eq!(tail(&bytes, 4), "xxxx");
    }
}
