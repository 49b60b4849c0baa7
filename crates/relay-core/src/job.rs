//! Job, JobSpec, and the state machine (spec.md §3, §4.3).

use crate::ids::{CommitHash, JobId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Job priority tier. Ordered so that `P0 < P1 < P2` sorts highest-priority
/// first when used as `ORDER BY priority ASC` in the Storage Kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum Priority {
    /// Highest priority.
    P0,
    /// Normal priority.
    P1,
    /// Lowest priority.
    P2,
}

/// Job lifecycle state (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Queued, waiting for a worker to acquire a lease.
    Queued,
    /// Leased by a worker and executing.
    Running,
    /// Paused mid-execution for an Ask to be answered.
    WaitingOnAnswer,
    /// Lease expired without completion; eligible for re-acquisition.
    Stale,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: failed.
    Failed,
    /// Terminal: canceled by an operator or executor.
    Canceled,
    /// Terminal: exceeded its TTL.
    Expired,
}

impl JobState {
    /// Terminal states never accept a further transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Expired
        )
    }

    /// Returns `true` iff `self → to` appears in the state machine fixed by
    /// spec.md §4.3.
    #[must_use]
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Queued, Expired)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Expired)
                | (Running, Stale)
                | (Running, WaitingOnAnswer)
                | (WaitingOnAnswer, Running)
                | (WaitingOnAnswer, Failed)
                | (WaitingOnAnswer, Canceled)
                | (WaitingOnAnswer, Expired)
                | (Stale, Running)
                | (Stale, Failed)
                | (Stale, Expired)
        )
    }
}

/// Machine-readable reason attached to a terminal or paused transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Generated diff failed the apply-check.
    Conflict,
    /// Runner or executor refused on policy grounds.
    Policy,
    /// Executor backend non-zero / crashed.
    ExecutorError,
    /// Operation exceeded its time budget.
    Timeout,
    /// Executor output did not parse into three sections.
    BadArtifacts,
    /// Anything else.
    InternalError,
}

/// Repository reference a job operates against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoRef {
    /// `"git"` (implemented) or `"local"` (rejected, see SPEC_FULL.md).
    #[serde(rename = "type")]
    pub repo_type: String,
    /// Clone URL, required when `type == "git"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local filesystem path, used only when `type == "local"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Branch to diff against.
    pub base_branch: String,
    /// Commit the executor's working tree must start from.
    pub baseline_commit: CommitHash,
}

/// Task description the executor is asked to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    /// Short title.
    pub title: String,
    /// Full task description.
    pub description: String,
    /// Acceptance criteria, checked informally by the executor.
    pub acceptance: Vec<String>,
}

/// Read/write scoping for the executor's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpec {
    /// Paths the executor may read.
    #[serde(default)]
    pub read_paths: Vec<String>,
    /// Optional glob restriction on touched files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_globs: Option<Vec<String>>,
    /// Whether wholesale reformatting is disallowed.
    #[serde(default)]
    pub disallow_reformatting: bool,
}

/// Optional pre-computed context snapshot attached to the JobSpec itself
/// (distinct from an Ask's `context_envelope`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    /// Digest of the directory tree at submission time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_tree_digest: Option<String>,
    /// Key function/type signatures relevant to the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_signatures: Option<Vec<String>>,
    /// Representative code snippets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippets: Option<Vec<String>>,
}

/// The fixed three-part output contract every executor must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputKind {
    /// Unified diff.
    Diff,
    /// Prose test plan.
    TestPlan,
    /// Free-form notes.
    Notes,
}

/// Execution parameters for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    /// Preferred LLM identifier, passed through to the executor backend.
    pub preferred_model: String,
    /// Always `"read-only"`; kept as an explicit field for forward
    /// compatibility, matching spec.md's fixed `sandbox=read-only`.
    #[serde(default = "default_sandbox")]
    pub sandbox: String,
    /// Always `"untrusted"`.
    #[serde(default = "default_ask_policy")]
    pub ask_policy: String,
    /// Per-job timeout in seconds; defaults to 300 (§4.4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Time-to-live in seconds from creation.
    pub ttl_s: u64,
}

fn default_sandbox() -> String {
    "read-only".to_string()
}
fn default_ask_policy() -> String {
    "untrusted".to_string()
}

/// Immutable job specification, as submitted by an executor (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Repository reference.
    pub repo: RepoRef,
    /// Task description.
    pub task: TaskSpec,
    /// Read/write scoping.
    #[serde(default)]
    pub scope: ScopeSpec,
    /// Optional submission-time context snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JobContext>,
    /// Execution parameters.
    pub execution: ExecutionSpec,
    /// Idempotency key; re-submitting the same key returns the same job
    /// while it is non-terminal.
    pub idempotency_key: String,
    /// Optional notification target (webhook url, etc.), opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

impl JobSpec {
    /// The fixed output contract every executor must satisfy.
    #[must_use]
    pub fn output_contract() -> [OutputKind; 3] {
        [OutputKind::Diff, OutputKind::TestPlan, OutputKind::Notes]
    }
}

/// A persisted unit of executor work (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque job id.
    pub id: JobId,
    /// Unique idempotency key supplied at submission.
    pub idempotency_key: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Strictly-monotone version bumped on every state write.
    pub state_version: u64,
    /// Scheduling priority (denormalized from `spec.execution.priority` for
    /// index-friendly queries).
    pub priority: Priority,
    /// Creation timestamp, ms since epoch.
    pub created_at: i64,
    /// First `acquireLease` timestamp, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// Timestamp the job reached a terminal state, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    /// Time-to-live in seconds.
    pub ttl_s: u64,
    /// Last heartbeat timestamp, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<i64>,
    /// Current lease holder, set iff `state ∈ {RUNNING, WAITING_ON_ANSWER}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// Lease expiry timestamp, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,
    /// Immutable submission spec.
    pub spec: JobSpec,
    /// Human-readable summary set by the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Machine-readable reason attached to failure/terminal transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
}

impl Job {
    /// `durationMs = finished_at - started_at`, computed when both are set
    /// (spec.md §4.3 `getStatus`).
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }

    /// `lastUpdate = finished_at ?? started_at ?? created_at` (spec.md §4.7
    /// `jobs_get`).
    #[must_use]
    pub fn last_update(&self) -> i64 {
        self.finished_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Asserts the invariant `lease_owner.is_some() ⇔ state ∈ {RUNNING,
    /// WAITING_ON_ANSWER}`; used by the Storage Kernel after every write.
    #[must_use]
    pub fn lease_invariant_holds(&self) -> bool {
        let expects_lease = matches!(self.state, JobState::Running | JobState::WaitingOnAnswer);
        self.lease_owner.is_some() == expects_lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_every_transition() {
        for terminal in [
            JobState::Succeeded,
            JobState::Failed,
            JobState::Canceled,
            JobState::Expired,
        ] {
            for target in [JobState::Queued, JobState::Running, JobState::Stale] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn queued_only_reaches_running_canceled_expired() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Canceled));
        assert!(JobState::Queued.can_transition_to(JobState::Expired));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::WaitingOnAnswer));
    }

    #[test]
    fn running_can_pause_on_ask_and_resume() {
        assert!(JobState::Running.can_transition_to(JobState::WaitingOnAnswer));
        assert!(JobState::WaitingOnAnswer.can_transition_to(JobState::Running));
    }

    #[test]
    fn stale_cannot_reach_waiting_on_answer() {
        assert!(!JobState::Stale.can_transition_to(JobState::WaitingOnAnswer));
        assert!(JobState::Stale.can_transition_to(JobState::Running));
    }

    #[test]
    fn priority_orders_p0_first() {
        let mut ps = vec![Priority::P2, Priority::P0, Priority::P1];
        ps.sort();
        assert_eq!(ps, vec![Priority::P0, Priority::P1, Priority::P2]);
    }

    #[test]
    fn duration_ms_requires_both_timestamps() {
        let mut job = sample_job();
        assert_eq!(job.duration_ms(), None);
        job.started_at = Some(100);
        assert_eq!(job.duration_ms(), None);
        job.finished_at = Some(150);
        assert_eq!(job.duration_ms(), Some(50));
    }

    #[test]
    fn last_update_prefers_finished_then_started_then_created() {
        let mut job = sample_job();
        assert_eq!(job.last_update(), job.created_at);
        job.started_at = Some(10);
        assert_eq!(job.last_update(), 10);
        job.finished_at = Some(20);
        assert_eq!(job.last_update(), 20);
    }

    #[test]
    fn lease_invariant_detects_violation() {
        let mut job = sample_job();
        job.state = JobState::Running;
        job.lease_owner = None;
        assert!(!job.lease_invariant_holds());
        job.lease_owner = Some("worker-1".to_string());
        assert!(job.lease_invariant_holds());
        job.state = JobState::Queued;
        assert!(!job.lease_invariant_holds());
    }

    fn sample_job() -> Job {
        Job {
            id: JobId::new("job_1"),
            idempotency_key: "k1".to_string(),
            state: JobState::Queued,
            state_version: 0,
            priority: Priority::P1,
            created_at: 1,
            started_at: None,
            finished_at: None,
            ttl_s: 3600,
            heartbeat_at: None,
            lease_owner: None,
            lease_expires_at: None,
            spec: sample_spec(),
            summary: None,
            reason_code: None,
        }
    }

    fn sample_spec() -> JobSpec {
        JobSpec {
            repo: RepoRef {
                repo_type: "git".to_string(),
                url: Some("https://example.invalid/repo.git".to_string()),
                path: None,
                base_branch: "main".to_string(),
                baseline_commit: CommitHash::new("deadbeef"),
            },
            task: TaskSpec {
                title: "t".to_string(),
                description: "d".to_string(),
                acceptance: vec![],
            },
            scope: ScopeSpec::default(),
            context: None,
            execution: ExecutionSpec {
                preferred_model: "gpt-4".to_string(),
                sandbox: default_sandbox(),
                ask_policy: default_ask_policy(),
                timeout_s: None,
                priority: Priority::P1,
                ttl_s: 3600,
            },
            idempotency_key: "k1".to_string(),
            notify: None,
        }
    }
}
