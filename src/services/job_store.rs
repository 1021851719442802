use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::segment::SegmentationResult;

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// In-memory job registry and the only place admission control happens.
///
/// One mutex guards the map; every operation holds it only for the in-memory
/// update, never across an await or the inference call. Each job is written
/// by the single pipeline task running it and read by any number of pollers.
pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically admit a new job if fewer than `max_concurrent` jobs are
    /// pending or running. The count and the insert happen in one critical
    /// section so concurrent submissions can never overshoot the limit.
    pub fn create_job_if_under_limit(
        &self,
        case_id: &str,
        fast_mode: bool,
        max_concurrent: usize,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.lock();
        let active = jobs.values().filter(|e| e.job.status.is_active()).count();
        if active >= max_concurrent {
            return Err(JobStoreError::CapacityExceeded {
                active,
                limit: max_concurrent,
            });
        }
        let job = Job::new(case_id, fast_mode);
        jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                cancel: CancellationToken::new(),
            },
        );
        drop(jobs);
        self.refresh_active_gauge();
        Ok(job)
    }

    /// Snapshot of a job's current state.
    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).map(|e| e.job.clone())
    }

    /// The cancellation token paired with a live job.
    pub fn cancel_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.lock().get(&id).map(|e| e.cancel.clone())
    }

    /// Record a progress milestone. Moves a Pending job to Running on first
    /// call; never lowers the progress value; silently ignored once the job
    /// is terminal or evicted, so a late write from an abandoned stage
    /// cannot resurrect a finished job.
    pub fn update_progress(&self, id: Uuid, progress: u8, message: &str) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };
        if entry.job.status.is_terminal() {
            return;
        }
        if entry.job.status == JobStatus::Pending {
            entry.job.status = JobStatus::Running;
            entry.job.started_at = Some(Utc::now());
        }
        let clamped = progress.min(100);
        if clamped > entry.job.progress {
            entry.job.progress = clamped;
        }
        entry.job.progress_message = message.to_string();
    }

    /// Transition to Completed with the assembled result. Exactly-once: a
    /// second terminal transition is a logic error surfaced to the caller.
    pub fn complete_job(&self, id: Uuid, result: SegmentationResult) -> Result<(), JobStoreError> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.job.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal(id));
        }
        let now = Utc::now();
        entry.job.status = JobStatus::Completed;
        entry.job.progress = 100;
        entry.job.progress_message = "Segmentation complete".to_string();
        entry.job.completed_at = Some(now);
        if entry.job.started_at.is_none() {
            entry.job.started_at = Some(now);
        }
        entry.job.result = Some(result);
        drop(jobs);
        self.refresh_active_gauge();
        Ok(())
    }

    /// Transition to Failed with a user-safe error description. Progress is
    /// frozen at its last value.
    pub fn fail_job(&self, id: Uuid, error: impl Into<String>) -> Result<(), JobStoreError> {
        let mut jobs = self.lock();
        let entry = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.job.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal(id));
        }
        let now = Utc::now();
        entry.job.status = JobStatus::Failed;
        entry.job.progress_message = "Error occurred".to_string();
        entry.job.completed_at = Some(now);
        if entry.job.started_at.is_none() {
            entry.job.started_at = Some(now);
        }
        entry.job.error = Some(error.into());
        drop(jobs);
        self.refresh_active_gauge();
        Ok(())
    }

    /// Signal a job to stop. The pipeline observes the token at stage
    /// boundaries and the invoker kills the external process, so the
    /// concurrency slot frees up without waiting for inference to finish.
    pub fn cancel_job(&self, id: Uuid) -> CancelOutcome {
        let jobs = self.lock();
        match jobs.get(&id) {
            None => CancelOutcome::NotFound,
            Some(entry) if entry.job.status.is_terminal() => CancelOutcome::AlreadyTerminal,
            Some(entry) => {
                entry.cancel.cancel();
                CancelOutcome::Signalled
            }
        }
    }

    /// Drop every job created before `ttl` ago, regardless of status, and
    /// return the evicted ids so the sweeper can remove their files. Live
    /// jobs are cancelled on the way out.
    pub fn evict_expired(&self, ttl: chrono::Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - ttl;
        let mut jobs = self.lock();
        let expired: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, e)| e.job.created_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = jobs.remove(id) {
                entry.cancel.cancel();
            }
        }
        drop(jobs);
        if !expired.is_empty() {
            self.refresh_active_gauge();
        }
        expired
    }

    /// Jobs currently counting against the concurrency ceiling.
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    /// All jobs currently retained, terminal ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn refresh_active_gauge(&self) {
        metrics::gauge!("segmentation_active_jobs").set(self.active_count() as f64);
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a cancel request, mapped to a status code by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Signalled,
    AlreadyTerminal,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("all {limit} job slots are busy ({active} active), try again shortly")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job {0} already reached a terminal state")]
    AlreadyTerminal(Uuid),
}

/// Periodic TTL sweep. Runs until cancelled; never invoked from the request
/// path. Evicted jobs lose their registry entry first, then their on-disk
/// results directory.
pub async fn run_ttl_sweeper(
    store: Arc<JobStore>,
    ttl: chrono::Duration,
    period: Duration,
    results_dir: PathBuf,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("TTL sweeper stopped");
                break;
            }
            _ = interval.tick() => {
                let evicted = store.evict_expired(ttl);
                if evicted.is_empty() {
                    continue;
                }
                tracing::info!(count = evicted.len(), "Evicted expired jobs");
                for id in evicted {
                    let dir = results_dir.join(id.to_string());
                    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(job_id = %id, error = %err, "Failed to remove evicted job results");
                        }
                    }
                }
            }
        }
    }
}
