//! WAL-journaled `rusqlite` backend (`--storage sqlite`).
//!
//! A single connection behind a blocking `Mutex` backs the whole kernel;
//! since every Storage Kernel operation only ever holds that lock for the
//! duration of one statement or short transaction, serializing all access
//! through it trivially satisfies spec.md §4.1's requirement that
//! `acquireLease` be serializable against itself and against
//! `updateJobState(CANCELED)` — no other writer can interleave. Blocking
//! calls run on `tokio::task::spawn_blocking` so the async runtime's worker
//! threads are never stalled on disk I/O.

use crate::store::{JobListFilter, JobStateUpdate, Store};
use async_trait::async_trait;
use relay_core::{
    Answer, ArtifactKind, ArtifactMeta, Ask, AskId, AskStatus, DecisionCacheEntry, Event, Job,
    JobId, JobSpec, JobState, LeaseOwner, Priority, ReasonCode,
};
use relay_error::{ErrorCode, RelayError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL,
    state TEXT NOT NULL,
    state_version INTEGER NOT NULL,
    priority TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    ttl_s INTEGER NOT NULL,
    heartbeat_at INTEGER,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    summary TEXT,
    reason_code TEXT,
    spec_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_state_priority_created ON jobs(state, priority, created_at);
CREATE INDEX IF NOT EXISTS jobs_lease_expires ON jobs(lease_expires_at) WHERE lease_expires_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS jobs_idempotency_key ON jobs(idempotency_key);

CREATE TABLE IF NOT EXISTS asks (
    ask_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    status TEXT NOT NULL,
    data_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS asks_job ON asks(job_id);

CREATE TABLE IF NOT EXISTS answers (
    ask_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    data_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS answers_job ON answers(job_id);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_job_ts ON events(job_id, ts);

CREATE TABLE IF NOT EXISTS artifacts (
    job_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    uri TEXT NOT NULL,
    digest TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (job_id, kind)
);

CREATE TABLE IF NOT EXISTS decision_cache (
    key TEXT PRIMARY KEY,
    data_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
"#;

/// WAL-journaled `rusqlite`-backed Storage Kernel.
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if necessary) a sqlite file at `path`, enable WAL
    /// journaling, and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err("open sqlite database"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err("set journal_mode=WAL"))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_err("enable foreign_keys"))?;
        conn.execute_batch(SCHEMA).map_err(storage_err("create schema"))?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Open a private in-memory database, primarily for tests that want to
    /// exercise the sqlite code path without touching disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err("open in-memory sqlite"))?;
        conn.execute_batch(SCHEMA).map_err(storage_err("create schema"))?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| RelayError::new(ErrorCode::StorageFailure, "storage task panicked").with_source(e))?
    }
}

fn storage_err(op: &'static str) -> impl FnOnce(rusqlite::Error) -> RelayError {
    move |e| RelayError::new(ErrorCode::StorageFailure, op).with_source(e)
}

fn priority_to_str(p: Priority) -> &'static str {
    match p {
        Priority::P0 => "P0",
        Priority::P1 => "P1",
        Priority::P2 => "P2",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "P0" => Priority::P0,
        "P2" => Priority::P2,
        _ => Priority::P1,
    }
}

fn state_to_str(s: JobState) -> &'static str {
    match s {
        JobState::Queued => "QUEUED",
        JobState::Running => "RUNNING",
        JobState::WaitingOnAnswer => "WAITING_ON_ANSWER",
        JobState::Stale => "STALE",
        JobState::Succeeded => "SUCCEEDED",
        JobState::Failed => "FAILED",
        JobState::Canceled => "CANCELED",
        JobState::Expired => "EXPIRED",
    }
}

fn state_from_str(s: &str) -> JobState {
    match s {
        "RUNNING" => JobState::Running,
        "WAITING_ON_ANSWER" => JobState::WaitingOnAnswer,
        "STALE" => JobState::Stale,
        "SUCCEEDED" => JobState::Succeeded,
        "FAILED" => JobState::Failed,
        "CANCELED" => JobState::Canceled,
        "EXPIRED" => JobState::Expired,
        _ => JobState::Queued,
    }
}

fn reason_to_str(r: ReasonCode) -> &'static str {
    match r {
        ReasonCode::Conflict => "CONFLICT",
        ReasonCode::Policy => "POLICY",
        ReasonCode::ExecutorError => "EXECUTOR_ERROR",
        ReasonCode::Timeout => "TIMEOUT",
        ReasonCode::BadArtifacts => "BAD_ARTIFACTS",
        ReasonCode::InternalError => "INTERNAL_ERROR",
    }
}

fn reason_from_str(s: &str) -> Option<ReasonCode> {
    Some(match s {
        "CONFLICT" => ReasonCode::Conflict,
        "POLICY" => ReasonCode::Policy,
        "EXECUTOR_ERROR" => ReasonCode::ExecutorError,
        "TIMEOUT" => ReasonCode::Timeout,
        "BAD_ARTIFACTS" => ReasonCode::BadArtifacts,
        "INTERNAL_ERROR" => ReasonCode::InternalError,
        _ => return None,
    })
}

fn ask_status_to_str(s: AskStatus) -> &'static str {
    match s {
        AskStatus::Pending => "PENDING",
        AskStatus::Answered => "ANSWERED",
        AskStatus::Rejected => "REJECTED",
        AskStatus::Timeout => "TIMEOUT",
        AskStatus::Error => "ERROR",
    }
}

fn artifact_kind_to_str(k: ArtifactKind) -> &'static str {
    k.file_name()
}

fn artifact_kind_from_str(s: &str) -> Option<ArtifactKind> {
    Some(match s {
        "patch.diff" => ArtifactKind::PatchDiff,
        "out.md" => ArtifactKind::OutMd,
        "logs.txt" => ArtifactKind::LogsTxt,
        "pr.json" => ArtifactKind::PrJson,
        _ => return None,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let spec_json: String = row.get("spec_json")?;
    let spec: JobSpec = serde_json::from_str(&spec_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let state: String = row.get("state")?;
    let priority: String = row.get("priority")?;
    let reason_code: Option<String> = row.get("reason_code")?;
    Ok(Job {
        id: JobId::new(row.get::<_, String>("id")?),
        idempotency_key: row.get("idempotency_key")?,
        state: state_from_str(&state),
        state_version: row.get::<_, i64>("state_version")? as u64,
        priority: priority_from_str(&priority),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        ttl_s: row.get::<_, i64>("ttl_s")? as u64,
        heartbeat_at: row.get("heartbeat_at")?,
        lease_owner: row.get("lease_owner")?,
        lease_expires_at: row.get("lease_expires_at")?,
        spec,
        summary: row.get("summary")?,
        reason_code: reason_code.as_deref().and_then(reason_from_str),
    })
}

fn row_to_ask(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ask> {
    let data_json: String = row.get("data_json")?;
    serde_json::from_str(&data_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_answer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Answer> {
    let data_json: String = row.get("data_json")?;
    serde_json::from_str(&data_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_json: String = row.get("payload_json")?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        id: row.get("id")?,
        job_id: JobId::new(row.get::<_, String>("job_id")?),
        ts: row.get("ts")?,
        event_type: row.get("type")?,
        payload,
    })
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactMeta> {
    let kind: String = row.get("kind")?;
    Ok(ArtifactMeta {
        job_id: JobId::new(row.get::<_, String>("job_id")?),
        kind: artifact_kind_from_str(&kind).unwrap_or(ArtifactKind::LogsTxt),
        uri: row.get("uri")?,
        digest: row.get("digest")?,
        size: row.get::<_, i64>("size")? as u64,
        created_at: row.get("created_at")?,
    })
}

fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionCacheEntry> {
    let data_json: String = row.get("data_json")?;
    serde_json::from_str(&data_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_job(
        &self,
        spec: JobSpec,
        priority: Priority,
        ttl_s: u64,
        now_ms: i64,
    ) -> Result<Job> {
        self.with_conn(move |conn| {
            let seq: i64 = conn
                .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
                .map_err(storage_err("count jobs"))?;
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
            let spec_json = serde_json::to_string(&job.spec)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "serialize JobSpec").with_source(e))?;
            conn.execute(
                "INSERT INTO jobs (id, idempotency_key, state, state_version, priority, created_at,
                    started_at, finished_at, ttl_s, heartbeat_at, lease_owner, lease_expires_at,
                    summary, reason_code, spec_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, NULL, NULL, NULL, NULL, NULL, ?8)",
                params![
                    id.as_str(),
                    job.idempotency_key,
                    state_to_str(job.state),
                    job.state_version as i64,
                    priority_to_str(priority),
                    now_ms,
                    ttl_s as i64,
                    spec_json,
                ],
            )
            .map_err(storage_err("insert job"))?;
            Ok(job)
        })
        .await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
                .optional()
                .map_err(storage_err("get job"))
        })
        .await
    }

    async fn get_job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        // Job rows are never deleted (spec.md §3 lifecycle: "never (audit)"),
        // so a key resubmitted after its prior job went terminal accumulates
        // more than one row. Prefer the still-open one (`submit`'s idempotent
        // reuse only applies to a non-terminal job); among rows with the same
        // openness, prefer the most recently created.
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM jobs WHERE idempotency_key = ?1
                 ORDER BY
                   CASE WHEN state IN ('SUCCEEDED','FAILED','CANCELED','EXPIRED') THEN 1 ELSE 0 END ASC,
                   created_at DESC
                 LIMIT 1",
                params![key],
                row_to_job,
            )
            .optional()
            .map_err(storage_err("get job by idempotency key"))
        })
        .await
    }

    async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>> {
        self.with_conn(move |conn| {
            let limit = if filter.limit == 0 { i64::MAX } else { filter.limit as i64 };
            let jobs = if let Some(state) = filter.state {
                conn.prepare(
                    "SELECT * FROM jobs WHERE state = ?1
                     ORDER BY priority ASC, created_at ASC LIMIT ?2 OFFSET ?3",
                )
                .map_err(storage_err("prepare list_jobs"))?
                .query_map(params![state_to_str(state), limit, filter.offset as i64], row_to_job)
                .map_err(storage_err("query list_jobs"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_jobs"))?
            } else {
                conn.prepare(
                    "SELECT * FROM jobs ORDER BY priority ASC, created_at ASC LIMIT ?1 OFFSET ?2",
                )
                .map_err(storage_err("prepare list_jobs"))?
                .query_map(params![limit, filter.offset as i64], row_to_job)
                .map_err(storage_err("query list_jobs"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_jobs"))?
            };
            Ok(jobs)
        })
        .await
    }

    async fn update_job_state(&self, update: JobStateUpdate) -> Result<Job> {
        self.with_conn(move |conn| {
            let finished_at = update.state.is_terminal().then_some(update.now_ms);
            let clears_lease = !matches!(update.state, JobState::Running | JobState::WaitingOnAnswer);
            let changed = conn
                .execute(
                    "UPDATE jobs SET
                        state = ?1,
                        state_version = state_version + 1,
                        finished_at = COALESCE(?2, finished_at),
                        reason_code = COALESCE(?3, reason_code),
                        summary = COALESCE(?4, summary),
                        lease_owner = CASE WHEN ?5 THEN NULL ELSE lease_owner END,
                        lease_expires_at = CASE WHEN ?5 THEN NULL ELSE lease_expires_at END
                     WHERE id = ?6",
                    params![
                        state_to_str(update.state),
                        finished_at,
                        update.reason_code.map(reason_to_str),
                        update.summary,
                        clears_lease,
                        update.id.as_str(),
                    ],
                )
                .map_err(storage_err("update job state"))?;
            if changed == 0 {
                return Err(RelayError::new(
                    ErrorCode::JobNotFound,
                    format!("job {} not found", update.id),
                ));
            }
            conn.query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![update.id.as_str()],
                row_to_job,
            )
            .map_err(storage_err("reload job after update"))
        })
        .await
    }

    async fn acquire_lease(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Option<JobId>> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs
                     WHERE state = 'QUEUED' AND (lease_expires_at IS NULL OR lease_expires_at < ?1)
                     ORDER BY priority ASC, created_at ASC LIMIT 1",
                    params![now_ms],
                    |r| r.get(0),
                )
                .optional()
                .map_err(storage_err("select lease candidate"))?;
            let Some(id) = id else {
                return Ok(None);
            };
            let changed = conn
                .execute(
                    "UPDATE jobs SET state = 'RUNNING', state_version = state_version + 1,
                        lease_owner = ?1, lease_expires_at = ?2, started_at = ?3, heartbeat_at = ?3
                     WHERE id = ?4 AND state = 'QUEUED'",
                    params![owner, now_ms + lease_ttl_ms, now_ms, id],
                )
                .map_err(storage_err("acquire lease"))?;
            if changed == 1 {
                Ok(Some(JobId::new(id)))
            } else {
                Ok(None)
            }
        })
        .await
    }

    async fn renew_lease(&self, id: &JobId, owner: &LeaseOwner, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE jobs SET heartbeat_at = ?1, lease_expires_at = ?1 + ?2
                     WHERE id = ?3 AND lease_owner = ?4 AND state IN ('RUNNING', 'WAITING_ON_ANSWER')",
                    params![now_ms, ttl_ms, id, owner],
                )
                .map_err(storage_err("renew lease"))?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release_lease(&self, id: &JobId, owner: &LeaseOwner) -> Result<()> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id, owner],
            )
            .map_err(storage_err("release lease"))?;
            Ok(())
        })
        .await
    }

    async fn create_ask(&self, ask: Ask) -> Result<Ask> {
        self.with_conn(move |conn| {
            let open: Option<String> = conn
                .query_row(
                    "SELECT ask_id FROM asks WHERE job_id = ?1 AND step_id = ?2 AND status = 'PENDING'",
                    params![ask.job_id.as_str(), ask.step_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(storage_err("check open ask"))?;
            if open.is_some() {
                return Err(RelayError::new(
                    ErrorCode::IllegalTransition,
                    format!(
                        "an Ask is already open for job {} step {}",
                        ask.job_id, ask.step_id
                    ),
                ));
            }
            let data_json = serde_json::to_string(&ask)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "serialize Ask").with_source(e))?;
            conn.execute(
                "INSERT INTO asks (ask_id, job_id, step_id, status, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ask.ask_id.as_str(),
                    ask.job_id.as_str(),
                    ask.step_id,
                    ask_status_to_str(ask.status),
                    data_json,
                ],
            )
            .map_err(storage_err("insert ask"))?;
            Ok(ask)
        })
        .await
    }

    async fn get_ask(&self, ask_id: &AskId) -> Result<Option<Ask>> {
        let ask_id = ask_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM asks WHERE ask_id = ?1",
                params![ask_id],
                row_to_ask,
            )
            .optional()
            .map_err(storage_err("get ask"))
        })
        .await
    }

    async fn get_open_ask(&self, job_id: &JobId, step_id: &str) -> Result<Option<Ask>> {
        let job_id = job_id.to_string();
        let step_id = step_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM asks WHERE job_id = ?1 AND step_id = ?2 AND status = 'PENDING'",
                params![job_id, step_id],
                row_to_ask,
            )
            .optional()
            .map_err(storage_err("get open ask"))
        })
        .await
    }

    async fn list_asks_for_job(&self, job_id: &JobId) -> Result<Vec<Ask>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM asks WHERE job_id = ?1 ORDER BY rowid ASC")
                .map_err(storage_err("prepare list_asks_for_job"))?;
            let rows = stmt
                .query_map(params![job_id], row_to_ask)
                .map_err(storage_err("query list_asks_for_job"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_asks_for_job"))?;
            Ok(rows)
        })
        .await
    }

    async fn update_ask_status(&self, ask_id: &AskId, status: AskStatus) -> Result<()> {
        let ask_id = ask_id.to_string();
        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM asks WHERE ask_id = ?1",
                    params![ask_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(storage_err("load ask for status update"))?;
            let Some(existing) = existing else {
                return Ok(());
            };
            let mut ask: Ask = serde_json::from_str(&existing)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "deserialize Ask").with_source(e))?;
            ask.status = status;
            let data_json = serde_json::to_string(&ask)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "serialize Ask").with_source(e))?;
            conn.execute(
                "UPDATE asks SET status = ?1, data_json = ?2 WHERE ask_id = ?3",
                params![ask_status_to_str(status), data_json, ask_id],
            )
            .map_err(storage_err("update ask status"))?;
            Ok(())
        })
        .await
    }

    async fn record_answer(&self, job_id: JobId, answer: Answer) -> Result<Answer> {
        self.with_conn(move |conn| {
            let data_json = serde_json::to_string(&answer)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "serialize Answer").with_source(e))?;
            conn.execute(
                "INSERT INTO answers (ask_id, job_id, data_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(ask_id) DO UPDATE SET job_id = excluded.job_id, data_json = excluded.data_json",
                params![answer.ask_id.as_str(), job_id.as_str(), data_json],
            )
            .map_err(storage_err("upsert answer"))?;
            Ok(answer)
        })
        .await
    }

    async fn get_answer(&self, ask_id: &AskId) -> Result<Option<Answer>> {
        let ask_id = ask_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM answers WHERE ask_id = ?1",
                params![ask_id],
                row_to_answer,
            )
            .optional()
            .map_err(storage_err("get answer"))
        })
        .await
    }

    async fn append_event(
        &self,
        job_id: JobId,
        ts: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let event_type = event_type.to_string();
        self.with_conn(move |conn| {
            let payload_json = serde_json::to_string(&payload)
                .map_err(|e| RelayError::new(ErrorCode::InternalError, "serialize event payload").with_source(e))?;
            conn.execute(
                "INSERT INTO events (job_id, ts, type, payload_json) VALUES (?1, ?2, ?3, ?4)",
                params![job_id.as_str(), ts, event_type, payload_json],
            )
            .map_err(storage_err("insert event"))?;
            let id = conn.last_insert_rowid();
            Ok(Event {
                id,
                job_id,
                ts,
                event_type,
                payload,
            })
        })
        .await
    }

    async fn list_events_for_job(&self, job_id: &JobId) -> Result<Vec<Event>> {
        let job_id_s = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM events WHERE job_id = ?1 ORDER BY ts ASC, id ASC")
                .map_err(storage_err("prepare list_events_for_job"))?;
            let rows = stmt
                .query_map(params![job_id_s], row_to_event)
                .map_err(storage_err("query list_events_for_job"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_events_for_job"))?;
            Ok(rows)
        })
        .await
    }

    async fn list_events_since(&self, job_id: &JobId, after_id: i64) -> Result<Vec<Event>> {
        let job_id_s = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM events WHERE job_id = ?1 AND id > ?2 ORDER BY id ASC")
                .map_err(storage_err("prepare list_events_since"))?;
            let rows = stmt
                .query_map(params![job_id_s, after_id], row_to_event)
                .map_err(storage_err("query list_events_since"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_events_since"))?;
            Ok(rows)
        })
        .await
    }

    async fn put_artifact(&self, meta: ArtifactMeta) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO artifacts (job_id, kind, uri, digest, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id, kind) DO UPDATE SET
                    uri = excluded.uri, digest = excluded.digest, size = excluded.size,
                    created_at = excluded.created_at",
                params![
                    meta.job_id.as_str(),
                    artifact_kind_to_str(meta.kind),
                    meta.uri,
                    meta.digest,
                    meta.size as i64,
                    meta.created_at,
                ],
            )
            .map_err(storage_err("upsert artifact"))?;
            Ok(())
        })
        .await
    }

    async fn get_artifact(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Option<ArtifactMeta>> {
        let job_id_s = job_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM artifacts WHERE job_id = ?1 AND kind = ?2",
                params![job_id_s, artifact_kind_to_str(kind)],
                row_to_artifact,
            )
            .optional()
            .map_err(storage_err("get artifact"))
        })
        .await
    }

    async fn list_artifacts_for_job(&self, job_id: &JobId) -> Result<Vec<ArtifactMeta>> {
        let job_id_s = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM artifacts WHERE job_id = ?1 ORDER BY kind ASC")
                .map_err(storage_err("prepare list_artifacts_for_job"))?;
            let rows = stmt
                .query_map(params![job_id_s], row_to_artifact)
                .map_err(storage_err("query list_artifacts_for_job"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err("collect list_artifacts_for_job"))?;
            Ok(rows)
        })
        .await
    }

    async fn decision_cache_get(&self, key: &str, now_ms: i64) -> Result<Option<DecisionCacheEntry>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let entry = conn
                .query_row(
                    "SELECT * FROM decision_cache WHERE key = ?1",
                    params![key],
                    row_to_cache_entry,
                )
                .optional()
                .map_err(storage_err("get decision cache entry"))?;
            Ok(entry.filter(|e| !e.is_expired(now_ms)))
        })
        .await
    }

    async fn decision_cache_upsert(&self, key: &str, entry: DecisionCacheEntry) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let data_json = serde_json::to_string(&entry).map_err(|e| {
                RelayError::new(ErrorCode::InternalError, "serialize DecisionCacheEntry").with_source(e)
            })?;
            conn.execute(
                "INSERT INTO decision_cache (key, data_json, created_at, ttl_seconds) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET data_json = excluded.data_json,
                    created_at = excluded.created_at, ttl_seconds = excluded.ttl_seconds",
                params![key, data_json, entry.created_at, entry.ttl_seconds as i64],
            )
            .map_err(storage_err("upsert decision cache entry"))?;
            Ok(())
        })
        .await
    }

    async fn purge_expired_decision_cache(&self, now_ms: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM decision_cache WHERE created_at + ttl_seconds * 1000 < ?1",
                    params![now_ms],
                )
                .map_err(storage_err("purge expired decision cache"))?;
            Ok(changed as u64)
        })
        .await
    }
}
