use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::SegmentationResult;
use crate::services::dataset::{CaseCatalog, CatalogError};
use crate::services::invoker::{InferenceInvoker, InferenceStatus, InvokeOptions, InvokerError};
use crate::services::job_store::JobStore;
use crate::services::quality;
use crate::services::staging::{self, StagingError, DWI_FILENAME};

/// Portion of the progress bar reserved for the inference run itself.
/// Adapter-reported percentages are mapped into this band.
const INVOKE_BAND_START: u8 = 30;
const INVOKE_BAND_END: u8 = 85;

/// Drives one admitted job through staging, inference, metrics and
/// finalization, reporting progress into the job store along the way.
pub struct SegmentationPipeline {
    store: Arc<JobStore>,
    catalog: Arc<CaseCatalog>,
    invoker: Arc<dyn InferenceInvoker>,
    config: Arc<AppConfig>,
}

impl SegmentationPipeline {
    pub fn new(
        store: Arc<JobStore>,
        catalog: Arc<CaseCatalog>,
        invoker: Arc<dyn InferenceInvoker>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            catalog,
            invoker,
            config,
        }
    }

    /// Run an admitted job to a terminal state. Never fails outward: every
    /// error ends up on the job record instead.
    pub async fn run(&self, job_id: Uuid) {
        let Some(job) = self.store.get_job(job_id) else {
            warn!(%job_id, "Job vanished before the pipeline started");
            return;
        };
        let cancel = self.store.cancel_token(job_id).unwrap_or_default();
        let started = Instant::now();
        counter!("segmentation_jobs_total").increment(1);
        info!(
            %job_id,
            case_id = %job.case_id,
            fast_mode = job.fast_mode,
            invoker = self.invoker.name(),
            "Job started"
        );

        let outcome = self
            .execute(job_id, &job.case_id, job.fast_mode, started, &cancel)
            .await;

        // Staged input copies are scratch data; drop them however the job ended.
        let staging_root = self.staging_root(job_id);
        if let Err(err) = tokio::fs::remove_dir_all(&staging_root).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(%job_id, error = %err, "Failed to clean staging directory");
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(result) => {
                counter!("segmentation_jobs_completed").increment(1);
                histogram!("segmentation_processing_seconds").record(elapsed);
                info!(
                    %job_id,
                    elapsed_seconds = elapsed,
                    dice_score = ?result.dice_score,
                    volume_ml = ?result.volume_ml,
                    "Job completed"
                );
                if let Err(err) = self.store.complete_job(job_id, result) {
                    warn!(%job_id, error = %err, "Could not record job completion");
                }
            }
            Err(err) => {
                counter!("segmentation_jobs_failed", "kind" => err.kind()).increment(1);
                warn!(%job_id, kind = err.kind(), error = %err, elapsed_seconds = elapsed, "Job failed");
                if let Err(store_err) = self.store.fail_job(job_id, err.user_message()) {
                    // Normal when the record was evicted mid-flight.
                    tracing::debug!(%job_id, error = %store_err, "Could not record job failure");
                }
            }
        }
    }

    async fn execute(
        &self,
        job_id: Uuid,
        case_id: &str,
        fast_mode: bool,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<SegmentationResult, PipelineError> {
        checkpoint(cancel)?;
        self.store.update_progress(job_id, 5, "Starting inference...");

        self.store.update_progress(job_id, 10, "Loading case data...");
        let files = self.catalog.case_files(case_id).await?;

        checkpoint(cancel)?;
        self.store.update_progress(job_id, 20, "Staging input files...");
        let staged = staging::stage_case(&files, &self.staging_root(job_id).join(case_id)).await?;

        let output_dir = self.config.results_dir.join(job_id.to_string()).join(case_id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|err| PipelineError::Internal(format!("could not create output directory: {err}")))?;

        checkpoint(cancel)?;
        self.store
            .update_progress(job_id, INVOKE_BAND_START, "Running inference...");
        let options = InvokeOptions {
            job_id,
            fast_mode,
            timeout: self.config.inference_timeout(),
            cancel: cancel.clone(),
        };
        let store = &self.store;
        let report = move |percent: u8, stage: &str| {
            let span = (INVOKE_BAND_END - INVOKE_BAND_START) as u16;
            let overall = INVOKE_BAND_START + (percent.min(100) as u16 * span / 100) as u8;
            store.update_progress(job_id, overall, stage);
        };
        let outcome = self
            .invoker
            .run(&staged.input_dir, &output_dir, &options, &report)
            .await?;
        histogram!("segmentation_inference_seconds").record(outcome.elapsed.as_secs_f64());

        let prediction_path = match outcome.status {
            InferenceStatus::Success => outcome
                .outputs
                .first()
                .cloned()
                .ok_or_else(|| {
                    PipelineError::Internal("invoker reported success without outputs".to_string())
                })?,
            InferenceStatus::Timeout { limit } => {
                return Err(PipelineError::Timeout(limit.as_secs()))
            }
            InferenceStatus::ProcessFailure {
                exit_code,
                stderr_excerpt,
            } => {
                return Err(PipelineError::Inference {
                    exit_code,
                    stderr_excerpt,
                })
            }
            InferenceStatus::OutputMissing { missing } => {
                return Err(PipelineError::OutputContract(missing))
            }
        };

        checkpoint(cancel)?;
        self.store
            .update_progress(job_id, INVOKE_BAND_END, "Computing metrics...");
        let mut warnings = Vec::new();
        let (dice_score, volume_ml) = self
            .compute_metrics(&prediction_path, files.ground_truth.as_deref(), &mut warnings)
            .await;

        checkpoint(cancel)?;
        self.store.update_progress(job_id, 95, "Preparing results...");
        // Keep the source DWI next to the prediction so both download links
        // survive staging cleanup.
        tokio::fs::copy(&staged.dwi_path, output_dir.join(DWI_FILENAME))
            .await
            .map_err(|err| PipelineError::Internal(format!("could not publish DWI copy: {err}")))?;

        let prediction_name = match prediction_path.file_name().and_then(OsStr::to_str) {
            Some(name) => name.to_string(),
            None => {
                return Err(PipelineError::Internal(
                    "prediction path has no file name".to_string(),
                ))
            }
        };

        Ok(SegmentationResult {
            case_id: case_id.to_string(),
            dice_score,
            volume_ml,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            dwi_url: self.file_url(job_id, case_id, DWI_FILENAME),
            prediction_url: self.file_url(job_id, case_id, &prediction_name),
            warnings,
        })
    }

    /// Metric failures degrade the result instead of failing the job.
    async fn compute_metrics(
        &self,
        prediction_path: &Path,
        ground_truth: Option<&Path>,
        warnings: &mut Vec<String>,
    ) -> (Option<f64>, Option<f64>) {
        let prediction = match quality::load_volume(prediction_path).await {
            Ok(volume) => volume,
            Err(err) => {
                warn!(path = %prediction_path.display(), error = %err, "Could not read prediction volume");
                warnings.push(format!("prediction volume unreadable: {err}"));
                return (None, None);
            }
        };
        let volume_ml = Some(quality::lesion_volume_ml(&prediction));

        let dice_score = match ground_truth {
            None => {
                warnings.push("no ground truth mask available, dice skipped".to_string());
                None
            }
            Some(path) => match quality::load_volume(path).await {
                Ok(truth) => match quality::dice_score(&prediction, &truth) {
                    Ok(score) => Some(score),
                    Err(err) => {
                        warnings.push(format!("dice computation failed: {err}"));
                        None
                    }
                },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Could not read ground truth volume");
                    warnings.push(format!("ground truth unreadable: {err}"));
                    None
                }
            },
        };

        (dice_score, volume_ml)
    }

    fn staging_root(&self, job_id: Uuid) -> PathBuf {
        self.config
            .results_dir
            .join(job_id.to_string())
            .join("staging")
    }

    fn file_url(&self, job_id: Uuid, case_id: &str, filename: &str) -> String {
        let path = format!("/files/{job_id}/{case_id}/{filename}");
        match &self.config.public_base_url {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), path),
            None => path,
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Backstop for the spawned pipeline task. `run` never fails outward, but a
/// panic inside it would otherwise leave the job Running and holding an
/// admission slot until the TTL sweep.
pub async fn watch_pipeline_task(
    store: Arc<JobStore>,
    job_id: Uuid,
    task: tokio::task::JoinHandle<()>,
) {
    let Err(err) = task.await else {
        return;
    };
    tracing::error!(%job_id, error = %err, "Pipeline task aborted");
    counter!("segmentation_jobs_failed", "kind" => "internal").increment(1);
    let message = PipelineError::Internal(err.to_string()).user_message();
    if let Err(store_err) = store.fail_job(job_id, message) {
        tracing::debug!(%job_id, error = %store_err, "Could not record job failure");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("inference timed out after {0} seconds")]
    Timeout(u64),

    #[error("inference process failed (exit code {exit_code}): {stderr_excerpt}")]
    Inference {
        exit_code: i32,
        stderr_excerpt: String,
    },

    #[error("inference finished without producing {0}")]
    OutputContract(String),

    #[error("job cancelled by user")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable failure class, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "input",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Inference { .. } => "inference",
            PipelineError::OutputContract(_) => "output",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// What lands on the job record. Internal detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => {
                "An internal error occurred while processing the job".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<CatalogError> for PipelineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownCase(id) => {
                PipelineError::InvalidInput(format!("case '{id}' not found in the dataset"))
            }
            CatalogError::InvalidCaseId(_) => PipelineError::InvalidInput(err.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<StagingError> for PipelineError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::MissingModality { .. } => PipelineError::InvalidInput(err.to_string()),
            StagingError::Io(inner) => PipelineError::Internal(format!("staging failed: {inner}")),
        }
    }
}

impl From<InvokerError> for PipelineError {
    fn from(err: InvokerError) -> Self {
        match err {
            InvokerError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;

    #[tokio::test]
    async fn panicked_pipeline_task_is_failed_by_its_watchdog() {
        let store = Arc::new(JobStore::new());
        let job = store
            .create_job_if_under_limit("sub-stroke0001", true, 1)
            .unwrap();

        let task = tokio::spawn(async { panic!("stage logic bug") });
        watch_pipeline_task(store.clone(), job.id, task).await;

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("An internal error occurred while processing the job")
        );
        assert_eq!(store.active_count(), 0, "admission slot must be released");
    }

    #[test]
    fn input_errors_surface_verbatim() {
        let err = PipelineError::from(CatalogError::UnknownCase("sub-x".to_string()));
        assert_eq!(err.kind(), "input");
        assert!(err.user_message().contains("sub-x"));
    }

    #[test]
    fn internal_detail_is_not_user_visible() {
        let err = PipelineError::Internal("mount /data/isles24 is gone".to_string());
        assert_eq!(err.kind(), "internal");
        assert!(!err.user_message().contains("/data/isles24"));
    }

    #[test]
    fn cancellation_maps_from_invoker() {
        let err = PipelineError::from(InvokerError::Cancelled);
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(err.kind(), "cancelled");
    }
}
