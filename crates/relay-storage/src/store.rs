//! The `Store` trait: the single persistence boundary every other
//! component reads and writes through (spec.md §4.1).

use async_trait::async_trait;
use relay_core::{
    Answer, ArtifactKind, ArtifactMeta, Ask, AskStatus, DecisionCacheEntry, Event, JobId,
    JobSpec, JobState, LeaseOwner, Priority, ReasonCode,
};
use relay_error::Result;

/// Filter/paging parameters for `listJobs`.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    /// Restrict to a single state, if set.
    pub state: Option<JobState>,
    /// Maximum rows returned.
    pub limit: u32,
    /// Rows to skip, for paging.
    pub offset: u32,
}

/// Parameters for `updateJobState`.
#[derive(Debug, Clone)]
pub struct JobStateUpdate {
    /// Job being transitioned.
    pub id: JobId,
    /// Target state.
    pub state: JobState,
    /// Reason attached to the transition, if any.
    pub reason_code: Option<ReasonCode>,
    /// Human-readable summary attached to the transition, if any.
    pub summary: Option<String>,
    /// Current time, ms since epoch; stamps `finished_at` when `state` is terminal.
    pub now_ms: i64,
}

/// The Storage Kernel's persistence contract (spec.md §4.1, C1).
///
/// Every operation returns a result-or-error value; no operation panics on
/// ordinary misuse (missing row, lost lease race). `acquireLease` is the one
/// operation that must be serializable against itself and against
/// `updateJobState(CANCELED)` — see each implementation's module docs for
/// how it achieves that.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new job with `state=QUEUED`, `state_version=0`.
    async fn create_job(&self, spec: JobSpec, priority: Priority, ttl_s: u64, now_ms: i64) -> Result<relay_core::Job>;

    /// Plain read by id.
    async fn get_job(&self, id: &JobId) -> Result<Option<relay_core::Job>>;

    /// Plain read by idempotency key.
    async fn get_job_by_idempotency_key(&self, key: &str) -> Result<Option<relay_core::Job>>;

    /// List jobs ordered by `priority ASC, created_at ASC`.
    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<relay_core::Job>>;

    /// Bump `state_version`, set `finished_at` iff the new state is
    /// terminal. Errors with [`relay_error::ErrorCode::JobNotFound`] if the
    /// row does not exist.
    async fn update_job_state(&self, update: JobStateUpdate) -> Result<relay_core::Job>;

    /// Single-transaction lease acquisition over the oldest eligible
    /// `QUEUED` job. Returns `None` if no job is eligible.
    async fn acquire_lease(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Option<JobId>>;

    /// Renew a held lease; `false` if `(id, owner)` no longer match or the
    /// job left `{RUNNING, WAITING_ON_ANSWER}`.
    async fn renew_lease(&self, id: &JobId, owner: &LeaseOwner, ttl_ms: i64, now_ms: i64) -> Result<bool>;

    /// Best-effort release; clears `lease_owner`/`lease_expires_at`.
    async fn release_lease(&self, id: &JobId, owner: &LeaseOwner) -> Result<()>;

    /// Insert a new Ask; fails if `(job_id, step_id)` already has an open Ask.
    async fn create_ask(&self, ask: Ask) -> Result<Ask>;

    /// Plain read by ask id.
    async fn get_ask(&self, ask_id: &relay_core::AskId) -> Result<Option<Ask>>;

    /// Fetch the currently open (`PENDING`) Ask for `(job_id, step_id)`, if any.
    async fn get_open_ask(&self, job_id: &JobId, step_id: &str) -> Result<Option<Ask>>;

    /// All Asks ever raised for a job, oldest first.
    async fn list_asks_for_job(&self, job_id: &JobId) -> Result<Vec<Ask>>;

    /// Update just an Ask's status (e.g. on Answer arrival or timeout sweep).
    async fn update_ask_status(&self, ask_id: &relay_core::AskId, status: AskStatus) -> Result<()>;

    /// Insert-or-replace the Answer for an Ask (retries upsert-replace per spec.md §3).
    async fn record_answer(&self, job_id: JobId, answer: Answer) -> Result<Answer>;

    /// Plain read by ask id.
    async fn get_answer(&self, ask_id: &relay_core::AskId) -> Result<Option<Answer>>;

    /// Append an audit-log row; `id` is assigned by the store.
    async fn append_event(
        &self,
        job_id: JobId,
        ts: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Event>;

    /// All events for a job, oldest first.
    async fn list_events_for_job(&self, job_id: &JobId) -> Result<Vec<Event>>;

    /// Events for a job strictly after `after_id`, oldest first — used by
    /// the SSE endpoint to resume a stream without re-sending history.
    async fn list_events_since(&self, job_id: &JobId, after_id: i64) -> Result<Vec<Event>>;

    /// Insert-or-replace artifact metadata; `(job_id, kind)` is unique.
    async fn put_artifact(&self, meta: ArtifactMeta) -> Result<()>;

    /// Plain read by `(job_id, kind)`.
    async fn get_artifact(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Option<ArtifactMeta>>;

    /// All artifacts recorded for a job.
    async fn list_artifacts_for_job(&self, job_id: &JobId) -> Result<Vec<ArtifactMeta>>;

    /// Read a cache entry, already filtering out entries expired as of `now_ms`.
    async fn decision_cache_get(&self, key: &str, now_ms: i64) -> Result<Option<DecisionCacheEntry>>;

    /// Insert-or-replace a cache entry.
    async fn decision_cache_upsert(&self, key: &str, entry: DecisionCacheEntry) -> Result<()>;

    /// Delete all entries expired as of `now_ms`; returns the count removed.
    async fn purge_expired_decision_cache(&self, now_ms: i64) -> Result<u64>;
}
