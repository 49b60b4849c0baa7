//! In-memory `Store` implementation (`--storage memory`), also the backend
//! used by the rest of the workspace's test suites.
//!
//! Grounded on the `Mutex<BTreeMap<...>>` entry-state pattern used by the
//! worker pool; here the whole storage surface sits behind one
//! `tokio::sync::Mutex` rather than per-row locks, since every operation
//! spec.md names is short and the Storage Kernel's own contract only
//! requires `acquireLease` to be serializable.

use crate::store::{JobListFilter, JobStateUpdate, Store};
use async_trait::async_trait;
use relay_core::{
    Answer, ArtifactKind, ArtifactMeta, Ask, AskId, AskStatus, DecisionCacheEntry, Event, Job,
    JobId, JobSpec, JobState, LeaseOwner, Priority, ReasonCode,
};
use relay_error::{ErrorCode, RelayError, Result};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    idempotency_index: BTreeMap<String, JobId>,
    asks: BTreeMap<AskId, Ask>,
    open_asks: BTreeMap<(JobId, String), AskId>,
    answers: BTreeMap<AskId, (JobId, Answer)>,
    events: Vec<Event>,
    next_event_id: i64,
    artifacts: BTreeMap<(JobId, ArtifactKind), ArtifactMeta>,
    decision_cache: BTreeMap<String, DecisionCacheEntry>,
    next_job_seq: u64,
}

/// In-memory Storage Kernel; state is lost when the process exits.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

fn not_found(id: &JobId) -> RelayError {
    RelayError::new(ErrorCode::JobNotFound, format!("job {id} not found"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(
        &self,
        spec: JobSpec,
        priority: Priority,
        ttl_s: u64,
        now_ms: i64,
    ) -> Result<Job> {
        let mut state = self.state.lock().await;
        let seq = state.next_job_seq;
        state.next_job_seq += 1;
        let id = relay_core::generate_job_id(now_ms, &format!("{seq:08x}"));
        let job = Job {
            id: id.clone(),
            idempotency_key: spec.idempotency_key.clone(),
            state: JobState::Queued,
            state_version: 0,
            priority,
            created_at: now_ms,
            started_at: None,
            finished_at: None,
            ttl_s,
            heartbeat_at: None,
            lease_owner: None,
            lease_expires_at: None,
            spec,
            summary: None,
            reason_code: None,
        };
        state
            .idempotency_index
            .insert(job.idempotency_key.clone(), id.clone());
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn get_job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency_index
            .get(key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        let limit = if filter.limit == 0 {
            jobs.len()
        } else {
            filter.limit as usize
        };
        Ok(jobs
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit)
            .collect())
    }

    async fn update_job_state(&self, update: JobStateUpdate) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&update.id)
            .ok_or_else(|| not_found(&update.id))?;
        job.state = update.state;
        job.state_version += 1;
        if update.state.is_terminal() {
            job.finished_at = Some(update.now_ms);
        }
        if update.reason_code.is_some() {
            job.reason_code = update.reason_code;
        }
        if update.summary.is_some() {
            job.summary = update.summary;
        }
        if !matches!(job.state, JobState::Running | JobState::WaitingOnAnswer) {
            job.lease_owner = None;
            job.lease_expires_at = None;
        }
        Ok(job.clone())
    }

    async fn acquire_lease(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Option<JobId>> {
        let mut state = self.state.lock().await;
        let candidate = state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Queued
                    && j.lease_expires_at.is_none_or(|exp| exp < now_ms)
            })
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)))
            .map(|j| j.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).expect("candidate id came from jobs map");
        job.state = JobState::Running;
        job.state_version += 1;
        job.lease_owner = Some(owner.to_string());
        job.lease_expires_at = Some(now_ms + lease_ttl_ms);
        job.started_at = Some(now_ms);
        job.heartbeat_at = Some(now_ms);
        Ok(Some(id))
    }

    async fn renew_lease(&self, id: &JobId, owner: &LeaseOwner, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        let owns = job.lease_owner.as_deref() == Some(owner.as_str());
        let eligible = matches!(job.state, JobState::Running | JobState::WaitingOnAnswer);
        if !owns || !eligible {
            return Ok(false);
        }
        job.heartbeat_at = Some(now_ms);
        job.lease_expires_at = Some(now_ms + ttl_ms);
        Ok(true)
    }

    async fn release_lease(&self, id: &JobId, owner: &LeaseOwner) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(id) {
            if job.lease_owner.as_deref() == Some(owner.as_str()) {
                job.lease_owner = None;
                job.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn create_ask(&self, ask: Ask) -> Result<Ask> {
        let mut state = self.state.lock().await;
        let key = (ask.job_id.clone(), ask.step_id.clone());
        if state.open_asks.contains_key(&key) {
            return Err(RelayError::new(
                ErrorCode::IllegalTransition,
                format!(
                    "an Ask is already open for job {} step {}",
                    ask.job_id, ask.step_id
                ),
            ));
        }
        state.open_asks.insert(key, ask.ask_id.clone());
        state.asks.insert(ask.ask_id.clone(), ask.clone());
        Ok(ask)
    }

    async fn get_ask(&self, ask_id: &AskId) -> Result<Option<Ask>> {
        Ok(self.state.lock().await.asks.get(ask_id).cloned())
    }

    async fn get_open_ask(&self, job_id: &JobId, step_id: &str) -> Result<Option<Ask>> {
        let state = self.state.lock().await;
        let key = (job_id.clone(), step_id.to_string());
        Ok(state
            .open_asks
            .get(&key)
            .and_then(|ask_id| state.asks.get(ask_id))
            .cloned())
    }

    async fn list_asks_for_job(&self, job_id: &JobId) -> Result<Vec<Ask>> {
        let state = self.state.lock().await;
        let mut asks: Vec<Ask> = state
            .asks
            .values()
            .filter(|a| &a.job_id == job_id)
            .cloned()
            .collect();
        asks.sort_by_key(|a| a.created_at);
        Ok(asks)
    }

    async fn update_ask_status(&self, ask_id: &AskId, status: AskStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(ask) = state.asks.get_mut(ask_id) {
            ask.status = status;
            if status != AskStatus::Pending {
                let key = (ask.job_id.clone(), ask.step_id.clone());
                state.open_asks.remove(&key);
            }
        }
        Ok(())
    }

    async fn record_answer(&self, job_id: JobId, answer: Answer) -> Result<Answer> {
        let mut state = self.state.lock().await;
        state
            .answers
            .insert(answer.ask_id.clone(), (job_id, answer.clone()));
        Ok(answer)
    }

    async fn get_answer(&self, ask_id: &AskId) -> Result<Option<Answer>> {
        Ok(self
            .state
            .lock()
            .await
            .answers
            .get(ask_id)
            .map(|(_, a)| a.clone()))
    }

    async fn append_event(
        &self,
        job_id: JobId,
        ts: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let mut state = self.state.lock().await;
        let id = state.next_event_id;
        state.next_event_id += 1;
        let event = Event {
            id,
            job_id,
            ts,
            event_type: event_type.to_string(),
            payload,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn list_events_for_job(&self, job_id: &JobId) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_events_since(&self, job_id: &JobId, after_id: i64) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| &e.job_id == job_id && e.id > after_id)
            .cloned()
            .collect())
    }

    async fn put_artifact(&self, meta: ArtifactMeta) -> Result<()> {
        let mut state = self.state.lock().await;
        state.artifacts.insert((meta.job_id.clone(), meta.kind), meta);
        Ok(())
    }

    async fn get_artifact(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Option<ArtifactMeta>> {
        Ok(self
            .state
            .lock()
            .await
            .artifacts
            .get(&(job_id.clone(), kind))
            .cloned())
    }

    async fn list_artifacts_for_job(&self, job_id: &JobId) -> Result<Vec<ArtifactMeta>> {
        let state = self.state.lock().await;
        let mut artifacts: Vec<ArtifactMeta> = state
            .artifacts
            .values()
            .filter(|a| &a.job_id == job_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.kind);
        Ok(artifacts)
    }

    async fn decision_cache_get(&self, key: &str, now_ms: i64) -> Result<Option<DecisionCacheEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .decision_cache
            .get(key)
            .filter(|e| !e.is_expired(now_ms))
            .cloned())
    }

    async fn decision_cache_upsert(&self, key: &str, entry: DecisionCacheEntry) -> Result<()> {
        self.state
            .lock()
            .await
            .decision_cache
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn purge_expired_decision_cache(&self, now_ms: i64) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.decision_cache.len();
        state.decision_cache.retain(|_, e| !e.is_expired(now_ms));
        Ok((before - state.decision_cache.len()) as u64)
    }
}
