//! Worker Pool (C4): the lease-acquire / heartbeat / execute / apply-check
//! loop spec.md §4.4 describes.
//!
//! Generalized from `abp-host::SidecarClient`'s spawn-and-supervise shape
//! (stderr drained in the background, a timeout guarding the call) combined
//! with `abp-host::pool`'s pool-of-workers-over-shared-state idiom,
//! retargeted from a fixed sidecar pool onto leased rows pulled from the
//! Storage Kernel.

use crate::artifacts::{ArtifactStore, FsArtifactStore, WriteOutcome};
use crate::backend::{BackendOutput, ExecutorBackend};
use crate::repo::{apply_check, prepare_repo, touched_paths};
use relay_core::{ArtifactKind, ArtifactMeta, Job, JobId, JobState, LeaseOwner, ReasonCode, RelayEvent};
use relay_error::{ErrorCode, RelayError, Result};
use relay_manager::JobManager;
use relay_policy::ScopePolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tuning knobs for a [`WorkerPool`] (mirrors `relay_config::WorkerConfig`'s
/// fields — this crate keeps its own copy to avoid a dependency on the
/// config crate, which belongs to the CLI wiring layer only).
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops to run.
    pub max_concurrency: u32,
    /// Lease duration granted per `acquireLease`/`renewLease` call, in ms.
    pub lease_ttl_ms: u64,
    /// How often a held lease is renewed, in ms. Should be well under
    /// `lease_ttl_ms` to tolerate a missed beat.
    pub heartbeat_interval_ms: u64,
    /// Sleep between `acquireLease` attempts when no job is eligible.
    pub poll_interval_ms: u64,
    /// Used when a job's `execution.timeout_s` is unset.
    pub default_job_timeout_ms: u64,
    /// Root directory artifacts are written under.
    pub artifact_root: PathBuf,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            lease_ttl_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            poll_interval_ms: 500,
            default_job_timeout_ms: 300_000,
            artifact_root: PathBuf::from("./artifacts"),
        }
    }
}

/// Owns `max_concurrency` worker loops, each independently leasing and
/// running jobs against a shared [`JobManager`] and [`ExecutorBackend`].
pub struct WorkerPool {
    manager: Arc<JobManager>,
    backend: Arc<dyn ExecutorBackend>,
    artifacts: Arc<dyn ArtifactStore>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Build a pool over the given manager and backend, writing artifacts
    /// under `config.artifact_root`.
    #[must_use]
    pub fn new(manager: Arc<JobManager>, backend: Arc<dyn ExecutorBackend>, config: WorkerPoolConfig) -> Self {
        let artifacts = Arc::new(FsArtifactStore::new(config.artifact_root.clone()));
        Self {
            manager,
            backend,
            artifacts,
            config,
        }
    }

    /// Spawn `max_concurrency` worker loops as detached tasks; returns their
    /// handles so the CLI can `abort()` them during shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.max_concurrency.max(1))
            .map(|i| {
                let this = Arc::clone(&self);
                let owner = LeaseOwner::new(format!("worker-{i}"));
                tokio::spawn(async move { this.worker_loop(owner).await })
            })
            .collect()
    }

    async fn worker_loop(&self, owner: LeaseOwner) {
        loop {
            match self
                .manager
                .store()
                .acquire_lease(&owner, self.config.lease_ttl_ms as i64, now_ms())
                .await
            {
                Ok(Some(job_id)) => {
                    if let Err(e) = self.run_leased_job(&owner, &job_id).await {
                        error!(job_id = %job_id, owner = %owner, error = %e, "worker failed to process leased job");
                    }
                }
                Ok(None) => sleep(Duration::from_millis(self.config.poll_interval_ms)).await,
                Err(e) => {
                    warn!(owner = %owner, error = %e, "acquire_lease errored");
                    sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }
    }

    async fn run_leased_job(&self, owner: &LeaseOwner, job_id: &JobId) -> Result<()> {
        let job = self
            .manager
            .get(job_id)
            .await?
            .ok_or_else(|| RelayError::new(ErrorCode::JobNotFound, "leased job vanished").with_context("jobId", job_id.as_str()))?;
        info!(job_id = %job_id, owner = %owner, "lease acquired");
        self.announce_running(&job).await?;

        let (lost_tx, lost_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(owner.clone(), job_id.clone(), lost_tx);

        let outcome = self.execute_job(&job, lost_rx).await;

        heartbeat.abort();
        let _ = self.manager.store().release_lease(job_id, owner).await;
        outcome
    }

    /// Publish the `job.state=RUNNING` transition caused by `acquireLease`,
    /// which writes straight through the Storage Kernel and so bypasses
    /// `JobManager::transition`'s own emit/publish.
    async fn announce_running(&self, job: &Job) -> Result<()> {
        self.manager
            .store()
            .append_event(
                job.id.clone(),
                now_ms(),
                "job.state",
                serde_json::json!({ "state": job.state, "reasonCode": job.reason_code, "summary": job.summary }),
            )
            .await?;
        self.manager.bus().publish(RelayEvent::JobState {
            job_id: job.id.clone(),
            state: job.state,
            state_version: job.state_version,
            summary: job.summary.clone(),
            reason_code: job.reason_code,
        });
        Ok(())
    }

    fn spawn_heartbeat(&self, owner: LeaseOwner, job_id: JobId, lost_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self.manager.store());
        let interval_ms = self.config.heartbeat_interval_ms;
        let ttl_ms = self.config.lease_ttl_ms as i64;
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(interval_ms)).await;
                match store.renew_lease(&job_id, &owner, ttl_ms, now_ms()).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        warn!(job_id = %job_id, owner = %owner, "lease renewal lost; abandoning job");
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, owner = %owner, error = %e, "renew_lease errored; abandoning job");
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        })
    }

    async fn execute_job(&self, job: &Job, mut lost_rx: watch::Receiver<bool>) -> Result<()> {
        let work_dir = tempfile::tempdir().map_err(|e| {
            RelayError::new(ErrorCode::InternalError, "failed to create isolated work directory").with_source(e)
        })?;

        if let Err(e) = prepare_repo(&job.spec.repo, work_dir.path()).await {
            return self.fail(job, classify(&e), &e.message).await;
        }

        let timeout_ms = job
            .spec
            .execution
            .timeout_s
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(self.config.default_job_timeout_ms);

        let outcome = tokio::select! {
            biased;
            _ = lost_rx.changed() => {
                warn!(job_id = %job.id, "lease lost mid-execution; backend call abandoned");
                return Ok(());
            }
            result = self.backend.execute(&job.spec, work_dir.path(), timeout_ms) => result,
        };

        let output = match outcome {
            Ok(o) => o,
            Err(e) => return self.fail(job, classify(&e), &e.message).await,
        };

        if let Some(violation) = self.scope_violation(job, &output) {
            return self.fail(job, ReasonCode::Policy, &violation).await;
        }

        if let Err(e) = self.write_artifacts(&job.id, &output).await {
            return self.fail(job, ReasonCode::BadArtifacts, &e.message).await;
        }

        match apply_check(&output.diff, work_dir.path()).await {
            Ok(true) => {}
            Ok(false) => return self.fail(job, ReasonCode::Conflict, "generated diff failed apply-check").await,
            Err(e) => return self.fail(job, classify(&e), &e.message).await,
        }

        self.manager
            .transition(&job.id, JobState::Succeeded, None, Some("execution completed".to_string()))
            .await?;
        Ok(())
    }

    /// If the job declared `scope.file_globs`, verify every path the diff
    /// touches is inside it (spec.md §4.4's scope enforcement).
    fn scope_violation(&self, job: &Job, output: &BackendOutput) -> Option<String> {
        if job.spec.scope.file_globs.is_none() {
            return None;
        }
        let policy = ScopePolicy::new(&job.spec.scope).ok()?;
        for path in touched_paths(&output.diff) {
            let decision = policy.can_write_path(&path);
            if !decision.allowed {
                return Some(format!("touched path {path:?} is outside the job's fileGlobs: {}", decision.reason));
            }
        }
        None
    }

    async fn write_artifacts(&self, job_id: &JobId, output: &BackendOutput) -> Result<()> {
        let out_md = format!("# Test Plan\n\n{}\n\n# Notes\n\n{}\n", output.test_plan, output.notes);
        let blobs: [(ArtifactKind, Vec<u8>); 3] = [
            (ArtifactKind::PatchDiff, output.diff.clone().into_bytes()),
            (ArtifactKind::OutMd, out_md.into_bytes()),
            (ArtifactKind::LogsTxt, output.raw_output.clone().into_bytes()),
        ];
        for (kind, bytes) in blobs {
            let WriteOutcome { digest, size } = self.artifacts.write(job_id, kind.file_name(), &bytes).await?;
            self.manager
                .store()
                .put_artifact(ArtifactMeta {
                    job_id: job_id.clone(),
                    kind,
                    uri: self.artifacts.uri(job_id, kind.file_name()),
                    digest,
                    size,
                    created_at: now_ms(),
                })
                .await?;
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: ReasonCode, summary: &str) -> Result<()> {
        self.manager
            .transition(&job.id, JobState::Failed, Some(reason), Some(summary.to_string()))
            .await?;
        Ok(())
    }
}

fn classify(e: &RelayError) -> ReasonCode {
    match e.code {
        ErrorCode::Timeout => ReasonCode::Timeout,
        ErrorCode::Policy => ReasonCode::Policy,
        ErrorCode::BadArtifacts => ReasonCode::BadArtifacts,
        ErrorCode::Conflict => ReasonCode::Conflict,
        _ => ReasonCode::ExecutorError,
    }
}
