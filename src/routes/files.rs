use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::routes::ApiError;

/// GET /files/{job_id}/{case_id}/{filename} — download one result artifact.
///
/// Serves only regular files that resolve inside the job's own case
/// directory; anything else reads as not found.
pub async fn download_result(
    State(state): State<AppState>,
    Path((job_id, case_id, filename)): Path<(Uuid, String, String)>,
) -> Result<Response, ApiError> {
    if !is_plain_name(&case_id) || !is_plain_name(&filename) {
        return Err(file_not_found(&filename));
    }

    let path = state
        .config
        .results_dir
        .join(job_id.to_string())
        .join(&case_id)
        .join(&filename);

    let resolved = tokio::fs::canonicalize(&path)
        .await
        .map_err(|_| file_not_found(&filename))?;
    let case_root = tokio::fs::canonicalize(&state.config.results_dir)
        .await
        .map_err(|_| file_not_found(&filename))?
        .join(job_id.to_string())
        .join(&case_id);
    if !resolved.starts_with(&case_root) {
        return Err(file_not_found(&filename));
    }

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| file_not_found(&filename))?;
    if !metadata.is_file() {
        return Err(file_not_found(&filename));
    }

    let file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|_| file_not_found(&filename))?;
    let stream = ReaderStream::new(file);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&filename))
        .header(header::CONTENT_LENGTH, metadata.len().to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal(err.to_string()))
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".nii.gz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}

/// A single path component: no separators, no parent references.
fn is_plain_name(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains('/')
        && !value.contains('\\')
        && !value.contains('\0')
}

fn file_not_found(filename: &str) -> ApiError {
    ApiError::not_found(format!("file '{filename}' not found"))
}
