//! Ask/Answer HTTP Bridge (C5): the long-poll and SSE surface an Answer
//! Runner and a human dashboard drive instead of talking to the Job Manager
//! directly (spec.md §4.5, §4.8).
//!
//! Generalized from this codebase's `abp-daemon` crate: the same
//! `AppState`/`ApiError`/`build_app` shape, retargeted from run-a-backend
//! onto submit/ask/answer, with the SSE stub replaced by real per-job
//! fan-out over [`relay_bus::EventBus`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as AxPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use relay_bus::FilteredSubscription;
use relay_core::{AnswerPayload, AskId, AskPayload, JobId, RelayEvent};
use relay_error::{ErrorCode, RelayError, RelayErrorBody};
use relay_manager::JobManager;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runtime knobs the Bridge needs that `relay-config`'s `BridgeConfig`
/// carries; kept as a plain struct here so this crate doesn't depend on the
/// config crate, which belongs to the CLI wiring layer only (same reasoning
/// as `relay_executor::WorkerPoolConfig`).
#[derive(Debug, Clone, Copy)]
pub struct BridgeRuntimeConfig {
    /// Hard ceiling on `GET /asks/{id}/answer?wait=Ns`, regardless of the
    /// client-requested `wait` value.
    pub long_poll_timeout_ms: u64,
    /// Cadence of the synthetic `heartbeat` SSE event.
    pub sse_heartbeat_ms: u64,
}

impl Default for BridgeRuntimeConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_ms: 30_000,
            sse_heartbeat_ms: 15_000,
        }
    }
}

/// A long-poll waiter's eventual resolution.
enum WaiterOutcome {
    /// The Answer arrived before the wait budget expired.
    Answer(relay_core::Answer),
    /// The bridge is shutting down; resolve with 503 immediately.
    ShuttingDown,
}

type WaiterMap = Mutex<HashMap<String, Vec<(u64, oneshot::Sender<WaiterOutcome>)>>>;

/// Shared state behind every route.
pub struct AppState {
    manager: Arc<JobManager>,
    config: BridgeRuntimeConfig,
    waiters: WaiterMap,
    next_waiter_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl AppState {
    /// Build bridge state over an already-wired [`JobManager`].
    #[must_use]
    pub fn new(manager: Arc<JobManager>, config: BridgeRuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            waiters: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Borrow the underlying job manager, e.g. for the CLI's shutdown
    /// sequence or tests driving the manager directly alongside the router.
    #[must_use]
    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    fn register_waiter(&self, ask_id: String, id: u64, tx: oneshot::Sender<WaiterOutcome>) {
        self.waiters.lock().unwrap().entry(ask_id).or_default().push((id, tx));
    }

    fn remove_waiter(&self, ask_id: &str, id: u64) {
        let mut guard = self.waiters.lock().unwrap();
        if let Some(list) = guard.get_mut(ask_id) {
            list.retain(|(waiter_id, _)| *waiter_id != id);
            if list.is_empty() {
                guard.remove(ask_id);
            }
        }
    }

    fn resolve_waiters(&self, ask_id: &str, answer: &relay_core::Answer) {
        let waiters = self.waiters.lock().unwrap().remove(ask_id);
        if let Some(waiters) = waiters {
            for (_, tx) in waiters {
                let _ = tx.send(WaiterOutcome::Answer(answer.clone()));
            }
        }
    }

    /// Stop accepting new waiters and resolve every pending long-poll with
    /// `ShuttingDown` so its handler can return 503 immediately. Called from
    /// the CLI's graceful-shutdown sequence before the listener stops.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut guard = self.waiters.lock().unwrap();
        for (_, list) in guard.drain() {
            for (_, tx) in list {
                let _ = tx.send(WaiterOutcome::ShuttingDown);
            }
        }
    }

    /// Spawn the background task that bridges [`relay_bus::EventBus`]
    /// `AnswerRecorded` notifications onto registered long-poll waiters.
    /// Must be running before any long-poll request can be satisfied by a
    /// concurrently-arriving answer.
    #[must_use]
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut sub = state.manager.bus().subscribe();
            while let Some(event) = sub.recv().await {
                if let RelayEvent::AnswerRecorded { answer, .. } = event {
                    state.resolve_waiters(answer.ask_id.as_str(), &answer);
                }
            }
        })
    }
}

/// HTTP-facing error wrapper; every handler error converts through this.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: RelayErrorBody,
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            body: RelayErrorBody::from(&err),
        }
    }
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: RelayErrorBody {
                code,
                message: message.into(),
                context: Default::default(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.body }))).into_response()
    }
}

/// Build the Axum router with every Bridge route (spec.md §4.5).
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/asks", post(create_ask))
        .route("/asks/{id}/answer", get(get_answer))
        .route("/answers", post(record_answer))
        .route("/jobs/{id}/asks", get(list_asks))
        .route("/jobs/{id}/events", get(job_events))
        .with_state(state)
}

async fn create_ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskPayload>,
) -> Result<Response, ApiError> {
    let ask = state.manager.create_ask(payload).await?;
    Ok((StatusCode::ACCEPTED, Json(ask)).into_response())
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    wait: Option<String>,
}

/// Parse a `wait=Ns` query value into milliseconds, clamped to `ceiling_ms`.
fn parse_wait_ms(raw: Option<&str>, ceiling_ms: u64) -> u64 {
    let requested = raw
        .and_then(|s| s.strip_suffix('s').unwrap_or(s).parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(ceiling_ms);
    requested.min(ceiling_ms)
}

struct WaiterGuard {
    state: Arc<AppState>,
    ask_id: String,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.state.remove_waiter(&self.ask_id, self.id);
    }
}

async fn get_answer(
    AxPath(ask_id): AxPath<String>,
    Query(params): Query<WaitQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let ask_id_typed = AskId::new(ask_id.clone());
    state
        .manager
        .store()
        .get_ask(&ask_id_typed)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed, "unknown ask id"))?;

    if let Some(answer) = state.manager.store().get_answer(&ask_id_typed).await? {
        return Ok((StatusCode::OK, Json(answer)).into_response());
    }

    if state.shutting_down.load(Ordering::SeqCst) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError,
            "bridge is shutting down",
        ));
    }

    let wait_ms = parse_wait_ms(params.wait.as_deref(), state.config.long_poll_timeout_ms);
    let id = state.next_waiter_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    state.register_waiter(ask_id.clone(), id, tx);
    let _guard = WaiterGuard {
        state: Arc::clone(&state),
        ask_id: ask_id.clone(),
        id,
    };

    match tokio::time::timeout(Duration::from_millis(wait_ms), rx).await {
        Ok(Ok(WaiterOutcome::Answer(answer))) => Ok((StatusCode::OK, Json(answer)).into_response()),
        Ok(Ok(WaiterOutcome::ShuttingDown)) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError,
            "bridge is shutting down",
        )),
        Ok(Err(_)) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError,
            "waiter dropped before resolution",
        )),
        Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn record_answer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnswerPayload>,
) -> Result<Response, ApiError> {
    let answer = state.manager.record_answer(payload).await?;
    Ok((StatusCode::ACCEPTED, Json(answer)).into_response())
}

async fn list_asks(
    AxPath(job_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id_typed = JobId::new(job_id.clone());
    let pairs = state.manager.asks_for_job(&job_id_typed).await?;
    let asks: Vec<_> = pairs
        .into_iter()
        .map(|(ask, answer)| json!({ "ask": ask, "answer": answer }))
        .collect();
    Ok(Json(json!({ "jobId": job_id, "asks": asks })))
}

fn frames_for(event: RelayEvent) -> Vec<SseEvent> {
    match event {
        RelayEvent::AskCreated { ask } => vec![SseEvent::default()
            .event("log")
            .data(json!({ "type": "ask.created", "askId": ask.ask_id.as_str(), "stepId": ask.step_id }).to_string())],
        RelayEvent::AnswerRecorded { answer, .. } => vec![
            SseEvent::default().event("answer").data(
                serde_json::to_string(&answer).unwrap_or_else(|_| "{}".to_string()),
            ),
            SseEvent::default().event("log").data(
                json!({ "type": "answer.recorded", "askId": answer.ask_id.as_str(), "status": answer.status }).to_string(),
            ),
        ],
        RelayEvent::JobState {
            state,
            state_version,
            summary,
            reason_code,
            ..
        } => vec![SseEvent::default().event("status").data(
            json!({
                "state": state,
                "stateVersion": state_version,
                "summary": summary,
                "reasonCode": reason_code,
            })
            .to_string(),
        )],
    }
}

struct SseState {
    sub: FilteredSubscription,
    heartbeat: Duration,
    queued: std::collections::VecDeque<SseEvent>,
}

fn event_stream(
    sub: FilteredSubscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let initial = SseState {
        sub,
        heartbeat,
        queued: std::collections::VecDeque::from([SseEvent::default().event("connected").data("{}")]),
    };
    stream::unfold(initial, move |mut st| async move {
        if let Some(frame) = st.queued.pop_front() {
            return Some((Ok(frame), st));
        }
        tokio::select! {
            ev = st.sub.recv() => match ev {
                Some(event) => {
                    let mut frames = frames_for(event);
                    if frames.is_empty() {
                        return Some((Ok(SseEvent::default().event("heartbeat").data("{}")), st));
                    }
                    let first = frames.remove(0);
                    st.queued.extend(frames);
                    Some((Ok(first), st))
                }
                None => None,
            },
            () = tokio::time::sleep(st.heartbeat) => {
                Some((Ok(SseEvent::default().event("heartbeat").data("{}")), st))
            }
        }
    })
}

async fn job_events(
    AxPath(job_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(job_id = %job_id, "sse client connected");
    let sub = state.manager.bus().subscribe_job(JobId::new(job_id));
    let heartbeat = Duration::from_millis(state.config.sse_heartbeat_ms);
    Sse::new(event_stream(sub, heartbeat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relay_bus::EventBus;
    use relay_core::{
        AskStatus, AskType, CommitHash, ExecutionSpec, JobSpec, Priority, RepoRef, ScopeSpec,
        TaskSpec,
    };
    use relay_storage::memory::MemoryStore;
    use tower::ServiceExt;

    fn sample_spec(key: &str) -> JobSpec {
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
                sandbox: "read-only".to_string(),
                ask_policy: "untrusted".to_string(),
                timeout_s: None,
                priority: Priority::P1,
                ttl_s: 3600,
            },
            idempotency_key: key.to_string(),
            notify: None,
        }
    }

    fn app() -> (Arc<AppState>, Router) {
        let manager = Arc::new(JobManager::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::new())));
        let state = AppState::new(manager, BridgeRuntimeConfig {
            long_poll_timeout_ms: 200,
            sse_heartbeat_ms: 50,
        });
        state.spawn_dispatcher();
        let router = build_app(Arc::clone(&state));
        (state, router)
    }

    #[tokio::test]
    async fn get_answer_on_unknown_ask_is_400() {
        let (_state, router) = app();
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/asks/nope/answer?wait=1s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn long_poll_times_out_with_204() {
        let (state, router) = app();
        let outcome = state.manager.submit(sample_spec("b1")).await.unwrap();
        state
            .manager
            .transition(&outcome.job_id, relay_core::JobState::Running, None, None)
            .await
            .unwrap();
        let ask = state
            .manager
            .create_ask(AskPayload {
                kind: "Ask".to_string(),
                ask_id: None,
                job_id: outcome.job_id.as_str().to_string(),
                step_id: "s1".to_string(),
                ask_type: AskType::Clarification,
                prompt: "p".to_string(),
                context_hash: "h".to_string(),
                context_envelope: json!({}),
                constraints: None,
                role_id: None,
                meta: None,
            })
            .await
            .unwrap();
        let uri = format!("/asks/{}/answer?wait=0s", ask.ask_id.as_str());
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn answer_arriving_during_long_poll_resolves_it() {
        let (state, router) = app();
        let outcome = state.manager.submit(sample_spec("b2")).await.unwrap();
        state
            .manager
            .transition(&outcome.job_id, relay_core::JobState::Running, None, None)
            .await
            .unwrap();
        let ask = state
            .manager
            .create_ask(AskPayload {
                kind: "Ask".to_string(),
                ask_id: None,
                job_id: outcome.job_id.as_str().to_string(),
                step_id: "s1".to_string(),
                ask_type: AskType::Clarification,
                prompt: "p".to_string(),
                context_hash: "h".to_string(),
                context_envelope: json!({}),
                constraints: None,
                role_id: None,
                meta: None,
            })
            .await
            .unwrap();

        let ask_id = ask.ask_id.as_str().to_string();
        let manager = Arc::clone(state.manager());
        let job_id = outcome.job_id.as_str().to_string();
        let answer_ask_id = ask_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            manager
                .record_answer(AnswerPayload {
                    kind: "Answer".to_string(),
                    ask_id: answer_ask_id,
                    job_id,
                    step_id: "s1".to_string(),
                    status: AskStatus::Answered,
                    answer_text: Some("ok".to_string()),
                    answer_json: None,
                    attestation: None,
                    artifacts: None,
                    policy_trace: None,
                    cacheable: Some(true),
                    ask_back: None,
                    error: None,
                })
                .await
                .unwrap();
        });

        let uri = format!("/asks/{ask_id}/answer?wait=1s");
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let answer: relay_core::Answer = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(answer.status, AskStatus::Answered);
    }

    #[test]
    fn wait_query_clamps_to_ceiling() {
        assert_eq!(parse_wait_ms(Some("60s"), 5_000), 5_000);
        assert_eq!(parse_wait_ms(Some("2s"), 5_000), 2_000);
        assert_eq!(parse_wait_ms(None, 5_000), 5_000);
    }
}
