//! Job Manager (C3): submit/get/list/cancel, Ask/Answer recording, and the
//! single place that enforces `relay_core::job::JobState`'s transition table
//! (spec.md §4.3).
//!
//! Generalized from this codebase's `abp-runtime::Runtime` orchestrator: the
//! same shape — hold a shared registry plus an event sink, expose a handful
//! of imperative operations, push every observable change out over a bus —
//! retargeted from backend-selection-and-streaming onto the scheduler's
//! submit/cancel/ask/answer calls. Every other component (HTTP Bridge,
//! Answer Runner, MCP surface, CLI) drives jobs exclusively through this
//! crate; none of them touch [`relay_storage::Store`] directly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use relay_bus::EventBus;
use relay_core::validate::{validate_answer_payload, validate_ask_payload, validate_job_spec};
use relay_core::{
    Answer, AnswerPayload, Ask, AskConstraints, AskId, AskPayload, AskStatus,
    AskType, Attestation, ArtifactKind, ArtifactMeta, Event, Job, JobId, JobSpec, JobState,
    Priority, ReasonCode, RelayEvent,
};
use relay_error::{ErrorCode, RelayError, Result};
use relay_storage::{JobListFilter, JobStateUpdate, Store};

/// `jobs_submit`'s result (spec.md §4.3 `submit`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// The job id — either freshly created or reused via idempotency key.
    pub job_id: JobId,
    /// `true` iff an existing non-terminal job was reused instead of a new
    /// row being created.
    pub reused: bool,
}

/// Computed read-through view returned by `getStatus`/`jobs_get` (spec.md
/// §4.3, §4.7).
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Job id.
    pub id: JobId,
    /// Current lifecycle state.
    pub state: JobState,
    /// Most recent human-readable summary, if any.
    pub summary: Option<String>,
    /// `finished_at ?? started_at ?? created_at`.
    pub last_update: i64,
    /// `finished_at - started_at` when both are set.
    pub duration_ms: Option<i64>,
    /// Number of times this job has reached `RUNNING` — counts lease
    /// (re)acquisitions, including STALE recovery.
    pub attempt: u32,
    /// The job's `pr.json` artifact, if the executor produced one.
    pub pr: Option<ArtifactMeta>,
}

/// Paged listing result for `jobs_list`.
#[derive(Debug, Clone)]
pub struct JobPage {
    /// The page of jobs.
    pub items: Vec<Job>,
    /// Total number of jobs matching the filter, ignoring paging.
    pub total: usize,
    /// Whether more rows exist past this page.
    pub has_more: bool,
}

/// Outcome of `cancel(id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// `false` if the job was already terminal and could not be canceled.
    pub ok: bool,
    /// The job's state after the call.
    pub state: JobState,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The Job Manager: owns no state of its own beyond handles to the Storage
/// Kernel and the Event Bus.
pub struct JobManager {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl JobManager {
    /// Build a manager over the given store and bus.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Borrow the underlying store, e.g. for components (Worker Pool,
    /// Answer Runner) that need read-through access this crate doesn't
    /// expose directly.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Borrow the event bus, for components that need to subscribe
    /// directly (HTTP Bridge long-poll/SSE).
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn emit(&self, job_id: JobId, event_type: &str, payload: serde_json::Value) -> Result<Event> {
        self.store.append_event(job_id, now_ms(), event_type, payload).await
    }

    /// Submit a new job, or reuse a non-terminal job already created under
    /// the same idempotency key (spec.md §4.3).
    pub async fn submit(&self, spec: JobSpec) -> Result<SubmitOutcome> {
        validate_job_spec(&spec)?;
        if spec.repo.repo_type == "local" {
            return Err(RelayError::new(
                ErrorCode::Policy,
                "local repositories are not supported; submit a git clone URL",
            )
            .with_context("repo_type", "local"));
        }

        if let Some(existing) = self.store.get_job_by_idempotency_key(&spec.idempotency_key).await? {
            if !existing.state.is_terminal() {
                return Ok(SubmitOutcome {
                    job_id: existing.id,
                    reused: true,
                });
            }
        }

        let priority = spec.execution.priority;
        let ttl_s = spec.execution.ttl_s;
        let job = self.store.create_job(spec, priority, ttl_s, now_ms()).await?;
        self.emit(
            job.id.clone(),
            "job.submitted",
            serde_json::json!({ "idempotencyKey": job.idempotency_key }),
        )
        .await?;
        self.bus.publish(RelayEvent::JobState {
            job_id: job.id.clone(),
            state: job.state,
            state_version: job.state_version,
            summary: None,
            reason_code: None,
        });
        Ok(SubmitOutcome {
            job_id: job.id,
            reused: false,
        })
    }

    /// Plain read by id.
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    /// Paged listing, optionally filtered to a single state.
    pub async fn list(&self, state: Option<JobState>, limit: u32, offset: u32) -> Result<JobPage> {
        let page = self
            .store
            .list_jobs(JobListFilter {
                state,
                limit,
                offset,
            })
            .await?;
        let total_unpaged = self
            .store
            .list_jobs(JobListFilter {
                state,
                limit: u32::MAX,
                offset: 0,
            })
            .await?
            .len();
        let has_more = (offset as usize + page.len()) < total_unpaged;
        Ok(JobPage {
            items: page,
            total: total_unpaged,
            has_more,
        })
    }

    /// Computed read-through status view (spec.md §4.7 `jobs_get`).
    pub async fn get_status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(None);
        };
        let events = self.store.list_events_for_job(id).await?;
        let attempt = events
            .iter()
            .filter(|e| {
                e.event_type == "job.state"
                    && e.payload.get("state").and_then(|v| v.as_str()) == Some("RUNNING")
            })
            .count() as u32;
        let pr = self.store.get_artifact(id, ArtifactKind::PrJson).await?;
        Ok(Some(JobStatus {
            id: job.id,
            state: job.state,
            summary: job.summary,
            last_update: job.last_update(),
            duration_ms: job.duration_ms(),
            attempt,
            pr,
        }))
    }

    /// Cancel a job; a no-op (`ok=false`) if it is already terminal.
    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let Some(job) = self.store.get_job(id).await? else {
            return Err(RelayError::new(ErrorCode::JobNotFound, "no such job").with_context("jobId", id.as_str()));
        };
        if job.state.is_terminal() {
            return Ok(CancelOutcome {
                ok: false,
                state: job.state,
            });
        }
        let updated = self.transition(id, JobState::Canceled, None, Some("Canceled by user".to_string())).await?;
        Ok(CancelOutcome {
            ok: true,
            state: updated.state,
        })
    }

    /// Guarded state transition; the single place `JobState::can_transition_to`
    /// is consulted before a write reaches the Storage Kernel.
    pub async fn transition(
        &self,
        id: &JobId,
        to: JobState,
        reason_code: Option<ReasonCode>,
        summary: Option<String>,
    ) -> Result<Job> {
        let current = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| RelayError::new(ErrorCode::JobNotFound, "no such job").with_context("jobId", id.as_str()))?;
        if !current.state.can_transition_to(to) {
            return Err(RelayError::new(
                ErrorCode::IllegalTransition,
                format!("job cannot move from {:?} to {:?}", current.state, to),
            )
            .with_context("jobId", id.as_str()));
        }
        let updated = self
            .store
            .update_job_state(JobStateUpdate {
                id: id.clone(),
                state: to,
                reason_code,
                summary: summary.clone(),
                now_ms: now_ms(),
            })
            .await?;
        self.emit(
            id.clone(),
            "job.state",
            serde_json::json!({
                "state": to,
                "reasonCode": reason_code,
                "summary": summary,
            }),
        )
        .await?;
        self.bus.publish(RelayEvent::JobState {
            job_id: id.clone(),
            state: updated.state,
            state_version: updated.state_version,
            summary: updated.summary.clone(),
            reason_code: updated.reason_code,
        });
        Ok(updated)
    }

    /// Raise a new Ask against a `RUNNING` job, pausing it to
    /// `WAITING_ON_ANSWER` (spec.md §4.6 step 1's caller-facing counterpart).
    pub async fn create_ask(&self, payload: AskPayload) -> Result<Ask> {
        validate_ask_payload(&payload)?;
        let job_id = JobId::new(payload.job_id.clone());
        let job = self
            .store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| RelayError::new(ErrorCode::JobNotFound, "no such job").with_context("jobId", job_id.as_str()))?;
        if job.state != JobState::Running {
            return Err(RelayError::new(
                ErrorCode::IllegalTransition,
                "asks may only be raised against a RUNNING job",
            )
            .with_context("jobId", job_id.as_str())
            .with_context("state", job.state));
        }
        if self.store.get_open_ask(&job_id, &payload.step_id).await?.is_some() {
            return Err(RelayError::new(
                ErrorCode::ValidationFailed,
                "an open ask already exists for this (jobId, stepId)",
            )
            .with_context("jobId", job_id.as_str())
            .with_context("stepId", payload.step_id.clone()));
        }

        let ask_id = payload
            .ask_id
            .clone()
            .map(AskId::new)
            .unwrap_or_else(|| AskId::new(uuid::Uuid::new_v4().to_string()));
        let ask = Ask {
            ask_id,
            job_id: job_id.clone(),
            step_id: payload.step_id.clone(),
            ask_type: payload.ask_type,
            prompt: payload.prompt.clone(),
            context_envelope: payload.context_envelope.clone(),
            context_hash: payload.context_hash.clone(),
            constraints: payload.constraints.clone(),
            role_id: payload.role_id.clone(),
            meta: payload.meta.clone(),
            created_at: now_ms(),
            status: AskStatus::Pending,
        };
        let ask = self.store.create_ask(ask).await?;
        self.emit(
            job_id.clone(),
            "ask.created",
            serde_json::json!({ "askId": ask.ask_id.as_str(), "stepId": ask.step_id }),
        )
        .await?;
        self.transition(&job_id, JobState::WaitingOnAnswer, None, None).await?;
        self.bus.publish(RelayEvent::AskCreated { ask: Box::new(ask.clone()) });
        Ok(ask)
    }

    /// Record an Answer, resuming or failing the owning job according to
    /// the Answer's status (spec.md §4.6 step 8's storage side).
    pub async fn record_answer(&self, payload: AnswerPayload) -> Result<Answer> {
        validate_answer_payload(&payload)?;
        let ask_id = AskId::new(payload.ask_id.clone());
        let ask = self
            .store
            .get_ask(&ask_id)
            .await?
            .ok_or_else(|| RelayError::new(ErrorCode::ValidationFailed, "no such ask").with_context("askId", ask_id.as_str()))?;

        let attestation: Option<Attestation> = payload.attestation.clone();
        let answer = Answer {
            ask_id: ask_id.clone(),
            status: payload.status,
            answer_text: payload.answer_text.clone(),
            answer_json: payload.answer_json.clone(),
            attestation,
            artifacts: payload.artifacts.clone().unwrap_or_default(),
            policy_trace: payload.policy_trace.clone(),
            cacheable: payload.cacheable.unwrap_or(true),
            ask_back: payload.ask_back.clone(),
            error: payload.error.clone(),
            created_at: now_ms(),
        };
        let answer = self.store.record_answer(ask.job_id.clone(), answer).await?;
        self.store.update_ask_status(&ask_id, answer.status).await?;
        self.emit(
            ask.job_id.clone(),
            "answer.recorded",
            serde_json::json!({ "askId": ask_id.as_str(), "status": answer.status }),
        )
        .await?;

        let (to, reason, summary) = match answer.status {
            AskStatus::Answered => (JobState::Running, None, None),
            AskStatus::Rejected => (
                JobState::Failed,
                Some(ReasonCode::Policy),
                answer.answer_text.clone().or_else(|| answer.error.clone()),
            ),
            AskStatus::Timeout => (JobState::Failed, Some(ReasonCode::Timeout), None),
            AskStatus::Error | AskStatus::Pending => {
                (JobState::Failed, Some(ReasonCode::ExecutorError), None)
            }
        };
        self.bus.publish(RelayEvent::AnswerRecorded {
            job_id: ask.job_id.clone(),
            answer: Box::new(answer.clone()),
        });
        self.transition(&ask.job_id, to, reason, summary).await?;
        Ok(answer)
    }

    /// Fetch every Ask raised for a job, paired with its Answer if recorded
    /// (spec.md §4.5 `GET /jobs/{id}/asks`).
    pub async fn asks_for_job(&self, job_id: &JobId) -> Result<Vec<(Ask, Option<Answer>)>> {
        let asks = self.store.list_asks_for_job(job_id).await?;
        let mut out = Vec::with_capacity(asks.len());
        for ask in asks {
            let answer = self.store.get_answer(&ask.ask_id).await?;
            out.push((ask, answer));
        }
        Ok(out)
    }

    /// Default constraints applied to an Ask when the executor supplied
    /// none (spec.md §4.6 uses the Ask's own constraints when present).
    #[must_use]
    pub fn default_constraints(ask_type: AskType) -> AskConstraints {
        let _ = ask_type;
        AskConstraints::default()
    }
}
