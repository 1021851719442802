use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Request to start a segmentation run for one dataset case.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRequest {
    #[garde(length(min = 1, max = 128), custom(is_safe_case_id))]
    pub case_id: String,

    /// Skip the slowest ensemble members for a quicker, rougher mask.
    #[garde(skip)]
    #[serde(default = "default_fast_mode")]
    pub fast_mode: bool,
}

fn default_fast_mode() -> bool {
    true
}

/// Case ids become path components under the dataset and results roots,
/// so the safe alphabet is enforced at the boundary.
fn is_safe_case_id(value: &str, _ctx: &()) -> garde::Result {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(garde::Error::new(
            "case id may only contain letters, digits, '-' and '_'",
        ))
    }
}

/// Response after a job is admitted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for polling job status.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,

    /// Present iff status == completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SegmentationResult>,

    /// Present iff status == failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let elapsed_seconds = job.elapsed_seconds();
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            progress_message: job.progress_message,
            elapsed_seconds,
            result: job.result,
            error: job.error,
        }
    }
}

/// The user-facing payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationResult {
    pub case_id: String,

    /// Dice overlap against ground truth; absent when the case ships no
    /// ground truth or the computation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dice_score: Option<f64>,

    /// Predicted lesion volume in millilitres; absent when the
    /// computation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<f64>,

    pub elapsed_seconds: f64,
    pub dwi_url: String,
    pub prediction_url: String,

    /// Non-fatal problems encountered while assembling the result.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

/// Response for listing the available dataset cases.
#[derive(Debug, Serialize, Deserialize)]
pub struct CasesResponse {
    pub cases: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_mode_defaults_to_true() {
        let req: SegmentRequest = serde_json::from_str(r#"{"caseId":"sub-stroke0001"}"#).unwrap();
        assert!(req.fast_mode);
        assert_eq!(req.case_id, "sub-stroke0001");
    }

    #[test]
    fn traversal_case_ids_fail_validation() {
        let req: SegmentRequest =
            serde_json::from_str(r#"{"caseId":"../../etc/passwd","fastMode":false}"#).unwrap();
        assert!(req.validate().is_err());

        let req: SegmentRequest = serde_json::from_str(r#"{"caseId":"sub-stroke0001"}"#).unwrap();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn status_response_omits_absent_fields() {
        let job = Job::new("sub-stroke0002", true);
        let body = serde_json::to_value(JobStatusResponse::from(job)).unwrap();
        assert_eq!(body["status"], "pending");
        assert!(body.get("result").is_none());
        assert!(body.get("error").is_none());
        assert!(body.get("elapsedSeconds").is_none());
        assert_eq!(body["progressMessage"], "Queued");
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = SegmentationResult {
            case_id: "sub-stroke0003".into(),
            dice_score: Some(0.82),
            volume_ml: Some(14.6),
            elapsed_seconds: 92.4,
            dwi_url: "/files/j/c/dwi.nii.gz".into(),
            prediction_url: "/files/j/c/lesion_msk.nii.gz".into(),
            warnings: vec![],
        };
        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(body["caseId"], "sub-stroke0003");
        assert_eq!(body["diceScore"], 0.82);
        assert_eq!(body["volumeMl"], 14.6);
        assert!(body.get("warnings").is_none());
    }
}
