use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::agent::CodingAgent;
use super::db::DbHandle;
use super::git::RepoDriver;
use super::models::{CodeJob, CodeJobStatus, CodeJobUpdate, SpecState};
use super::state::StateTracker;
use super::ws::{WsMessage, broadcast_message};
use crate::config::WorkerConfig;
use crate::errors::FactoryError;

const CANCELLED: &str = "cancelled: server shutting down";
const RESTARTED: &str = "orphaned: server restarted while the job was processing";

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitCodeJob {
    #[serde(default)]
    pub game_spec_id: String,
    pub game_spec: Option<serde_json::Value>,
    pub output_path: Option<String>,
}

/// Terminal failure of a job at a given progress point.
///
/// `lost` means another party already settled the row, so it must not be
/// written again.
#[derive(Debug)]
struct JobFailure {
    progress: i32,
    message: String,
    lost: bool,
}

impl JobFailure {
    fn at(progress: i32, message: impl Into<String>) -> Self {
        Self {
            progress,
            message: message.into(),
            lost: false,
        }
    }

    fn lost(progress: i32) -> Self {
        Self {
            progress,
            message: "code job is no longer owned by this worker".to_string(),
            lost: true,
        }
    }
}

/// Queues code generation jobs and runs them on a bounded worker pool.
///
/// `submit` only inserts the row and offers the ID to the queue; the
/// dispatcher started by [`spawn_workers`](Self::spawn_workers) claims and
/// runs jobs, at most `WorkerConfig::concurrency` at a time.
pub struct CodeJobCoordinator {
    db: DbHandle,
    tracker: StateTracker,
    repo: Arc<dyn RepoDriver>,
    agent: Arc<dyn CodingAgent>,
    ws_tx: broadcast::Sender<String>,
    queue: mpsc::Sender<String>,
    cancel: CancellationToken,
    workers: TaskTracker,
    config: WorkerConfig,
}

impl CodeJobCoordinator {
    /// Returns the coordinator plus the receiving end of its queue, to be
    /// handed to [`spawn_workers`](Self::spawn_workers).
    pub fn new(
        db: DbHandle,
        tracker: StateTracker,
        repo: Arc<dyn RepoDriver>,
        agent: Arc<dyn CodingAgent>,
        ws_tx: broadcast::Sender<String>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let coordinator = Arc::new(Self {
            db,
            tracker,
            repo,
            agent,
            ws_tx,
            queue,
            cancel,
            workers: TaskTracker::new(),
            config,
        });
        (coordinator, rx)
    }

    // ── Submission ────────────────────────────────────────────────────

    pub async fn submit(&self, req: SubmitCodeJob) -> Result<CodeJob, FactoryError> {
        let spec_id = req.game_spec_id.trim().to_string();
        if spec_id.is_empty() {
            return Err(FactoryError::InvalidInput("game_spec_id is required".into()));
        }

        let output_path = req.output_path.filter(|p| !p.is_empty()).or_else(|| {
            let root = self.repo.repo_path();
            (!root.as_os_str().is_empty()).then(|| root.display().to_string())
        });
        let job_id = uuid::Uuid::new_v4().to_string();

        let (id, sid) = (job_id.clone(), spec_id.clone());
        let inserted = self
            .db
            .call(move |db| {
                let Some(spec) = db.get_game_spec(&sid)? else {
                    return Ok(Err(FactoryError::not_found("Game spec", sid)));
                };
                let snapshot = req.game_spec.unwrap_or(spec.spec_json);
                match db.create_code_job(&id, &sid, &snapshot, output_path.as_deref())? {
                    Some(job) => Ok(Ok(job)),
                    None => Ok(Err(FactoryError::Conflict(format!(
                        "game spec {} already has a queued or processing code job",
                        sid
                    )))),
                }
            })
            .await
            .map_err(FactoryError::Database)?;
        let job = inserted?;

        if let Err(e) = self.queue.try_send(job_id.clone()) {
            let (reason, err) = match e {
                mpsc::error::TrySendError::Full(_) => ("code job queue is full", FactoryError::QueueFull),
                mpsc::error::TrySendError::Closed(_) => (
                    "code job workers are not running",
                    FactoryError::Other(anyhow::anyhow!("code job workers are not running")),
                ),
            };
            tracing::warn!(job_id = %job_id, spec_id = %spec_id, reason, "Rejecting code job");
            let (id, update) = (
                job_id.clone(),
                CodeJobUpdate::failed(0, reason, vec![reason.to_string()]),
            );
            if let Some(job) = self
                .db
                .call(move |db| db.reject_queued_code_job(&id, &update))
                .await
                .map_err(FactoryError::Database)?
            {
                broadcast_message(&self.ws_tx, &WsMessage::CodeJobUpdated { job });
            }
            return Err(err);
        }

        tracing::info!(job_id = %job_id, spec_id = %spec_id, "Code job queued");
        broadcast_message(&self.ws_tx, &WsMessage::CodeJobUpdated { job: job.clone() });
        Ok(job)
    }

    /// Queue a job for a spec using its persisted document and the default
    /// output path.
    pub async fn submit_for_spec(&self, spec_id: &str) -> Result<CodeJob, FactoryError> {
        self.submit(SubmitCodeJob {
            game_spec_id: spec_id.to_string(),
            game_spec: None,
            output_path: None,
        })
        .await
    }

    /// Start over with a brand-new job; earlier jobs are left untouched.
    pub async fn retry_for_spec(&self, spec_id: &str) -> Result<CodeJob, FactoryError> {
        tracing::info!(spec_id, "Retrying code generation");
        self.submit_for_spec(spec_id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<CodeJob, FactoryError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.get_code_job(&id))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| FactoryError::not_found("Code job", job_id))
    }

    pub async fn latest_for_spec(&self, spec_id: &str) -> Result<Option<CodeJob>, FactoryError> {
        let id = spec_id.to_string();
        self.db
            .call(move |db| db.latest_code_job_for_spec(&id))
            .await
            .map_err(FactoryError::Database)
    }

    // ── Worker pool ───────────────────────────────────────────────────

    /// Dispatcher: pulls job IDs off the queue and runs each on its own task,
    /// bounded by a semaphore. Stops when the cancellation token fires.
    pub fn spawn_workers(self: &Arc<Self>, mut rx: mpsc::Receiver<String>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(this.config.concurrency.max(1)));
            loop {
                let job_id = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let worker = Arc::clone(&this);
                this.workers.spawn(async move {
                    worker.run_job(&job_id).await;
                    drop(permit);
                });
            }
            tracing::info!("Code job dispatcher stopped");
        })
    }

    /// Periodically fail jobs whose heartbeat went stale.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.reap_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = this.reap_stale().await {
                            tracing::error!(error = %e, "Failed to reap stale code jobs");
                        }
                    }
                }
            }
        })
    }

    /// Startup recovery. No worker of this process can own a `processing`
    /// row yet, so those are failed whatever their age; then stale jobs are
    /// reaped and the ones still waiting are re-queued.
    pub async fn recover(&self) -> Result<(), FactoryError> {
        let orphaned = self
            .db
            .call(|db| db.fail_processing_code_jobs(RESTARTED))
            .await
            .map_err(FactoryError::Database)?;
        for job_id in &orphaned {
            tracing::warn!(job_id = %job_id, "Failed code job left processing by a previous run");
        }
        self.reap_stale().await?;
        let queued = self
            .db
            .call(|db| db.queued_code_job_ids())
            .await
            .map_err(FactoryError::Database)?;
        for job_id in queued {
            if self.queue.try_send(job_id.clone()).is_err() {
                tracing::warn!(job_id = %job_id, "Queue full during recovery, job left queued");
                break;
            }
            tracing::info!(job_id = %job_id, "Re-queued code job");
        }
        Ok(())
    }

    /// Cancel the workers, wait up to `shutdown_grace` for them to record
    /// their outcome, then fail whatever is still `processing`.
    pub async fn shutdown(&self) -> Result<(), FactoryError> {
        self.cancel.cancel();
        self.workers.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.workers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.workers.len(),
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Code job workers did not stop in time"
            );
        }
        let abandoned = self
            .db
            .call(|db| db.fail_processing_code_jobs(CANCELLED))
            .await
            .map_err(FactoryError::Database)?;
        for job_id in &abandoned {
            tracing::warn!(job_id = %job_id, "Cancelled code job still processing at shutdown");
        }
        Ok(())
    }

    pub async fn reap_stale(&self) -> Result<Vec<String>, FactoryError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .context("Job staleness window out of range")?;
        let cutoff = (chrono::Utc::now() - stale_after)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let error = format!(
            "orphaned: no progress for {}s",
            self.config.stale_after.as_secs()
        );
        let reaped = self
            .db
            .call(move |db| db.reap_stale_code_jobs(&cutoff, &error))
            .await
            .map_err(FactoryError::Database)?;
        for job_id in &reaped {
            tracing::warn!(job_id = %job_id, "Reaped orphaned code job");
        }
        Ok(reaped)
    }

    // ── Job execution ─────────────────────────────────────────────────

    /// Run one job to a terminal state. Never panics on job failure; the
    /// outcome is recorded on the job row.
    pub async fn run_job(&self, job_id: &str) {
        let claimed = {
            let id = job_id.to_string();
            let logs = vec!["Starting code generation job".to_string()];
            self.db.call(move |db| db.claim_code_job(&id, &logs)).await
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id, "Code job no longer queued, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to claim code job");
                return;
            }
        }
        self.announce(job_id).await;

        match self.process(job_id).await {
            Ok(()) => {}
            Err(failure) if failure.lost => {
                tracing::warn!(
                    job_id,
                    progress = failure.progress,
                    "Code job was taken away from its worker, stopping"
                );
            }
            Err(failure) => {
                tracing::warn!(
                    job_id,
                    progress = failure.progress,
                    error = %failure.message,
                    "Code job failed"
                );
                let update =
                    CodeJobUpdate::failed(failure.progress, failure.message.clone(), vec![failure.message]);
                match self.write(job_id, update).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(job_id, "Code job no longer owned, failure not recorded")
                    }
                    Err(e) => tracing::error!(job_id, error = %e, "Failed to record code job failure"),
                }
            }
        }
    }

    async fn process(&self, job_id: &str) -> Result<(), JobFailure> {
        let job = self.get(job_id).await.map_err(|e| JobFailure::at(20, e.to_string()))?;
        let spec_id = job
            .game_spec_id
            .ok_or_else(|| JobFailure::at(0, "code job is not linked to a game spec"))?;

        self.checkpoint(20)?;
        let id = spec_id.clone();
        let spec = self
            .db
            .call(move |db| db.get_game_spec(&id))
            .await
            .map_err(|e| JobFailure::at(0, format!("Failed to load game spec: {:#}", e)))?
            .ok_or_else(|| JobFailure::at(0, format!("game spec {} not found", spec_id)))?;

        self.step(
            job_id,
            40,
            vec!["Game spec retrieved".to_string(), format!("Title: {}", spec.title)],
        )
        .await?;

        if !self.repo.is_configured() {
            let err = FactoryError::Configuration(
                "git repository is not configured (set GIT_REPO_PATH, GIT_REPO_URL and GIT_TOKEN)".into(),
            );
            return Err(JobFailure::at(0, err.to_string()));
        }
        self.tracker
            .advance_to(&spec_id, SpecState::GitIniting, "Starting git repository initialization")
            .await
            .map_err(|e| JobFailure::at(0, e.to_string()))?;
        self.repo
            .initialize_repo()
            .await
            .map_err(|e| JobFailure::at(0, format!("Failed to initialize git repository: {}", e)))?;

        self.checkpoint(40)?;
        let folder = self
            .repo
            .create_game_folder(&spec)
            .await
            .map_err(|e| JobFailure::at(0, format!("Failed to create game folder: {}", e)))?;
        let folder_path = folder.display().to_string();

        self.step(
            job_id,
            60,
            vec!["Project folder created".to_string(), format!("Path: {}", folder_path)],
        )
        .await?;
        self.step(job_id, 80, vec!["Committing game folder to git repository".to_string()])
            .await?;

        self.checkpoint(80)?;
        if let Err(e) = self.repo.commit_and_push(&spec.id, &spec.title).await {
            tracing::warn!(job_id, spec_id = %spec.id, error = %e, "Git push failed, finishing without delegation");
            let mut update = CodeJobUpdate::new(
                CodeJobStatus::Completed,
                100,
                vec![
                    "Warning: failed to push to git repository".to_string(),
                    e.to_string(),
                ],
            );
            update.output_path = Some(folder_path);
            return self.finish(job_id, update).await;
        }

        self.step(job_id, 85, vec!["Game folder pushed to repository".to_string()])
            .await?;

        self.tracker
            .advance_to(&spec.id, SpecState::GitInited, "Game folder pushed to repository")
            .await
            .map_err(|e| JobFailure::at(80, e.to_string()))?;
        self.tracker
            .advance_to(&spec.id, SpecState::CodeGenerating, "Delegating implementation to coding agent")
            .await
            .map_err(|e| JobFailure::at(80, e.to_string()))?;

        self.checkpoint(85)?;
        let session = self
            .agent
            .create_session(&spec.id, &spec.title)
            .await
            .map_err(|e| JobFailure::at(85, format!("Failed to create coding agent session: {}", e)))?;

        let (id, sid) = (spec.id.clone(), session.session_id.clone());
        if let Err(e) = self.db.call(move |db| db.set_devin_session_id(&id, &sid)).await {
            tracing::warn!(spec_id = %spec.id, error = %e, "Failed to store coding agent session id");
        }

        let browse_url = self.repo.browse_url(&spec.id);
        let session_url = session
            .url
            .clone()
            .unwrap_or_else(|| self.agent.session_url(&session.session_id));
        let mut update = CodeJobUpdate::new(
            CodeJobStatus::Completed,
            100,
            vec![
                "Game folder pushed to repository".to_string(),
                format!("Browse: {}", browse_url),
                format!("Coding agent session: {}", session_url),
            ],
        );
        update.artifact_url = Some(browse_url);
        update.output_path = Some(folder_path);
        self.finish(job_id, update).await?;

        tracing::info!(job_id, spec_id = %spec.id, session_id = %session.session_id, "Code job completed");
        Ok(())
    }

    fn checkpoint(&self, progress: i32) -> Result<(), JobFailure> {
        if self.cancel.is_cancelled() {
            return Err(JobFailure::at(progress, CANCELLED));
        }
        Ok(())
    }

    async fn step(&self, job_id: &str, progress: i32, logs: Vec<String>) -> Result<(), JobFailure> {
        self.finish(job_id, CodeJobUpdate::new(CodeJobStatus::Processing, progress, logs))
            .await
    }

    /// Write an update the worker must still own the row for.
    async fn finish(&self, job_id: &str, update: CodeJobUpdate) -> Result<(), JobFailure> {
        let progress = update.progress;
        match self.write(job_id, update).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(JobFailure::lost(progress)),
            Err(e) => Err(JobFailure::at(progress, e.to_string())),
        }
    }

    /// Returns `false` when the job is no longer `processing`.
    async fn write(&self, job_id: &str, update: CodeJobUpdate) -> Result<bool, FactoryError> {
        let id = job_id.to_string();
        let job = self
            .db
            .call(move |db| db.update_code_job(&id, &update))
            .await
            .map_err(FactoryError::Database)?;
        match job {
            Some(job) => {
                broadcast_message(&self.ws_tx, &WsMessage::CodeJobUpdated { job });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn announce(&self, job_id: &str) {
        if let Ok(job) = self.get(job_id).await {
            broadcast_message(&self.ws_tx, &WsMessage::CodeJobUpdated { job });
        }
    }
}
