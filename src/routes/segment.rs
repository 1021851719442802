use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::{CreateJobResponse, JobStatusResponse, SegmentRequest};
use crate::routes::ApiError;
use crate::services::job_store::{CancelOutcome, JobStoreError};
use crate::services::pipeline::watch_pipeline_task;

/// POST /api/segment — admit a segmentation job and run it in the background.
pub async fn submit_segmentation(
    State(state): State<AppState>,
    Json(request): Json<SegmentRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    if let Err(report) = request.validate() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, report.to_string()));
    }

    let job = state
        .jobs
        .create_job_if_under_limit(
            &request.case_id,
            request.fast_mode,
            state.config.max_concurrent_jobs,
        )
        .map_err(|err| match err {
            JobStoreError::CapacityExceeded { .. } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            other => ApiError::internal(other.to_string()),
        })?;

    let job_id = job.id;
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.run(job_id).await });
    tokio::spawn(watch_pipeline_task(state.jobs.clone(), job_id, task));

    tracing::info!(%job_id, case_id = %request.case_id, fast_mode = request.fast_mode, "Accepted segmentation job");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id,
            status: job.status,
            message: format!("Segmentation of case '{}' started", request.case_id),
        }),
    ))
}

/// GET /api/jobs/{job_id} — poll the status of a submitted job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.jobs.get_job(job_id).ok_or_else(|| {
        ApiError::not_found(format!(
            "job '{job_id}' not found, records expire {} seconds after creation",
            state.config.job_ttl_secs
        ))
    })?;
    Ok(Json(JobStatusResponse::from(job)))
}

/// POST /api/jobs/{job_id}/cancel — stop a running job and kill its process.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    match state.jobs.cancel_job(job_id) {
        CancelOutcome::Signalled => {
            tracing::info!(%job_id, "Cancellation requested");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "jobId": job_id, "status": "cancelling" })),
            ))
        }
        CancelOutcome::AlreadyTerminal => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("job '{job_id}' has already finished"),
        )),
        CancelOutcome::NotFound => Err(ApiError::not_found(format!("job '{job_id}' not found"))),
    }
}
