//! Background Job Manager. A registry of background jobs keyed by job id;
//! lifecycle, progress, cancellation, cleanup.
//!
//! Grounded in `WorkerManager`'s one-task-per-worker model
//! (`crates/agent/src/agent/worker_manager.rs`) and the `AtomicBool`
//! cancellation flag guarding `ModeApprovalBackend`: each job owns a
//! `JoinHandle` plus an `Arc<JobHandle>` the worker polls for
//! cancellation, while external callers only ever touch the handle's
//! `RwLock<JobState>` — never the task directly.

pub mod workers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DownloadModel,
    DownloadVoice,
    TrainVoice,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DownloadModel => "download_model",
            JobKind::DownloadVoice => "download_voice",
            JobKind::TrainVoice => "train_voice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelled,
    Failed,
    Completed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Failed | JobStatus::Completed)
    }
}

/// `{job_id, kind, name, status, progress_percent, started_at,
/// completed_at?, error?, cancel_requested, last_update}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub name: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub last_update: chrono::DateTime<chrono::Utc>,
}

/// Handle shared between the registry and a job's worker task. The worker
/// is the sole mutator of `state`; the cancel flag is the only thing an
/// external caller may set directly (cooperative cancellation).
pub struct JobHandle {
    state: RwLock<Job>,
    cancel_flag: AtomicBool,
}

impl JobHandle {
    pub async fn snapshot(&self) -> Job {
        self.state.read().await.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Update progress. Callers must pass a value `>=` the previous one;
    /// the handle enforces the monotonic-progress invariant by clamping
    /// downward moves.
    pub async fn set_progress(&self, percent: u8) {
        let mut job = self.state.write().await;
        if job.status != JobStatus::Running {
            return;
        }
        if percent > job.progress_percent {
            job.progress_percent = percent;
        }
        job.last_update = chrono::Utc::now();
    }

    pub async fn mark_running(&self) {
        let mut job = self.state.write().await;
        job.status = JobStatus::Running;
        job.last_update = chrono::Utc::now();
    }

    pub async fn mark_completed(&self) {
        let mut job = self.state.write().await;
        job.status = JobStatus::Completed;
        job.progress_percent = 100;
        job.completed_at = Some(chrono::Utc::now());
        job.last_update = job.completed_at.unwrap();
    }

    pub async fn mark_failed(&self, error: impl Into<String>) {
        let mut job = self.state.write().await;
        job.status = JobStatus::Failed;
        job.error = Some(error.into());
        job.completed_at = Some(chrono::Utc::now());
        job.last_update = job.completed_at.unwrap();
    }

    pub async fn mark_cancelled(&self) {
        let mut job = self.state.write().await;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now());
        job.last_update = job.completed_at.unwrap();
    }
}

/// A worker implements the body of one job kind. `run` must poll
/// `handle.cancel_requested()` at each natural checkpoint and is
/// responsible for removing any partial artifacts itself before
/// returning on cancellation or error.
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
}

struct Entry {
    handle: Arc<JobHandle>,
    task: tokio::task::JoinHandle<()>,
}

/// Registry of background jobs. The outer lock is held only for map
/// mutation, never across I/O.
pub struct JobManager {
    jobs: RwLock<HashMap<Uuid, Entry>>,
    retention_cap: usize,
}

impl JobManager {
    pub fn new(retention_cap: usize) -> Self {
        JobManager {
            jobs: RwLock::new(HashMap::new()),
            retention_cap,
        }
    }

    /// `submit(kind, name, worker) -> job_id`. Rejects a duplicate
    /// `(kind, name)` while one is active (`JobAlreadyExists`).
    pub async fn submit(
        &self,
        kind: JobKind,
        name: String,
        worker: Arc<dyn JobWorker>,
    ) -> Result<Uuid, GatewayError> {
        {
            let jobs = self.jobs.read().await;
            for entry in jobs.values() {
                let job = entry.handle.snapshot().await;
                if job.kind == kind && job.name == name && !job.status.is_terminal() {
                    return Err(GatewayError::JobAlreadyExists(format!(
                        "{}:{}",
                        kind.as_str(),
                        name
                    )));
                }
            }
        }

        let job_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let job = Job {
            job_id,
            kind,
            name: name.clone(),
            status: JobStatus::Queued,
            progress_percent: 0,
            started_at: now,
            completed_at: None,
            error: None,
            cancel_requested: false,
            last_update: now,
        };
        let handle = Arc::new(JobHandle {
            state: RwLock::new(job),
            cancel_flag: AtomicBool::new(false),
        });

        let task_handle = Arc::clone(&handle);
        let task = tokio::task::spawn(async move {
            task_handle.mark_running().await;
            info!(job_id = %job_id, kind = kind.as_str(), name = %name, "job started");
            match worker.run(Arc::clone(&task_handle)).await {
                Ok(()) => {
                    task_handle.mark_completed().await;
                    info!(job_id = %job_id, "job completed");
                }
                Err(GatewayError::Cancelled) => {
                    task_handle.mark_cancelled().await;
                    info!(job_id = %job_id, "job cancelled");
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "job failed");
                    task_handle.mark_failed(e.to_string()).await;
                }
            }
        });

        let mut jobs = self.jobs.write().await;
        jobs.insert(job_id, Entry { handle, task });
        self.evict_over_cap(&mut jobs).await;
        Ok(job_id)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Job, GatewayError> {
        let jobs = self.jobs.read().await;
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))?;
        Ok(entry.handle.snapshot().await)
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut out = Vec::with_capacity(jobs.len());
        for entry in jobs.values() {
            let job = entry.handle.snapshot().await;
            if let Some(kind) = filter.kind {
                if job.kind != kind {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            out.push(job);
        }
        out.sort_by_key(|j| j.started_at);
        out
    }

    /// `cancel(job_id, confirm=true) -> ack | refused`. Cancelling an
    /// already-terminal job is a no-op that returns ack.
    pub async fn cancel(&self, job_id: Uuid, confirm: bool) -> Result<(), GatewayError> {
        if !confirm {
            return Err(GatewayError::JobCancelRefused);
        }
        let jobs = self.jobs.read().await;
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| GatewayError::JobNotFound(job_id.to_string()))?;
        let job = entry.handle.snapshot().await;
        if job.status.is_terminal() {
            return Ok(());
        }
        entry.handle.request_cancel();
        {
            let mut state = entry.handle.state.write().await;
            state.cancel_requested = true;
        }
        Ok(())
    }

    pub async fn cancel_all(&self, filter: &JobFilter, confirm: bool) -> Result<Vec<Uuid>, GatewayError> {
        if !confirm {
            return Err(GatewayError::JobCancelRefused);
        }
        let matching = self.list(filter).await;
        let mut cancelled = Vec::new();
        for job in matching {
            if !job.status.is_terminal() {
                self.cancel(job.job_id, true).await?;
                cancelled.push(job.job_id);
            }
        }
        Ok(cancelled)
    }

    /// Removes all jobs in terminal states, returning the count removed.
    pub async fn cleanup(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let terminal_ids: Vec<Uuid> = {
            let mut ids = Vec::new();
            for (id, entry) in jobs.iter() {
                if entry.handle.snapshot().await.status.is_terminal() {
                    ids.push(*id);
                }
            }
            ids
        };
        let removed = terminal_ids.len();
        for id in terminal_ids {
            if let Some(entry) = jobs.remove(&id) {
                entry.task.abort();
            }
        }
        removed
    }

    async fn evict_over_cap(&self, jobs: &mut HashMap<Uuid, Entry>) {
        if jobs.len() <= self.retention_cap {
            return;
        }
        let mut terminal: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = Vec::new();
        for (id, entry) in jobs.iter() {
            let job = entry.handle.snapshot().await;
            if job.status.is_terminal() {
                terminal.push((*id, job.started_at));
            }
        }
        terminal.sort_by_key(|(_, started_at)| *started_at);
        let overflow = jobs.len().saturating_sub(self.retention_cap);
        for (id, _) in terminal.into_iter().take(overflow) {
            if let Some(entry) = jobs.remove(&id) {
                entry.task.abort();
            }
        }
    }
}

/// Helper for workers: sleep in small increments while repeatedly checking
/// cancellation, so a worker never blocks past the bounded-checkpoint
/// contract.
pub async fn checkpointed_sleep(handle: &JobHandle, total: Duration, chunk: Duration) -> Result<(), GatewayError> {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if handle.cancel_requested() {
            return Err(GatewayError::Cancelled);
        }
        tokio::time::sleep(chunk.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InstantWorker;

    #[async_trait]
    impl JobWorker for InstantWorker {
        async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError> {
            handle.set_progress(50).await;
            handle.set_progress(100).await;
            Ok(())
        }
    }

    struct NeverEndingWorker;

    #[async_trait]
    impl JobWorker for NeverEndingWorker {
        async fn run(&self, handle: Arc<JobHandle>) -> Result<(), GatewayError> {
            loop {
                if handle.cancel_requested() {
                    return Err(GatewayError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[tokio::test]
    async fn submit_and_complete() {
        let manager = JobManager::new(200);
        let id = manager
            .submit(JobKind::DownloadModel, "m1".into(), Arc::new(InstantWorker))
            .await
            .unwrap();
        for _ in 0..20 {
            let job = manager.status(id).await.unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.progress_percent, 100);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never completed");
    }

    #[tokio::test]
    async fn duplicate_active_job_is_rejected() {
        let manager = JobManager::new(200);
        manager
            .submit(JobKind::DownloadModel, "dup".into(), Arc::new(NeverEndingWorker))
            .await
            .unwrap();
        let err = manager
            .submit(JobKind::DownloadModel, "dup".into(), Arc::new(NeverEndingWorker))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "JobAlreadyExists");
    }

    #[tokio::test]
    async fn cancel_requires_confirmation() {
        let manager = JobManager::new(200);
        let id = manager
            .submit(JobKind::TrainVoice, "v1".into(), Arc::new(NeverEndingWorker))
            .await
            .unwrap();
        let err = manager.cancel(id, false).await.unwrap_err();
        assert_eq!(err.kind(), "JobCancelRefused");
        manager.cancel(id, true).await.unwrap();
        for _ in 0..20 {
            let job = manager.status(id).await.unwrap();
            if job.status == JobStatus::Cancelled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never observed cancellation");
    }

    #[tokio::test]
    async fn cancelling_terminal_job_is_noop() {
        let manager = JobManager::new(200);
        let id = manager
            .submit(JobKind::DownloadModel, "m2".into(), Arc::new(InstantWorker))
            .await
            .unwrap();
        loop {
            if manager.status(id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.cancel(id, true).await.unwrap();
        assert_eq!(manager.status(id).await.unwrap().status, JobStatus::Completed);
    }
}
