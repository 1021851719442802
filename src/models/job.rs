use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::segment::SegmentationResult;

/// Status of a segmentation job in the in-memory registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// States that count against the concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// One tracked segmentation job, from admission to eviction.
///
/// Mutated only through `JobStore` operations by the single pipeline task
/// running it; read concurrently by status pollers.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub case_id: String,
    pub fast_mode: bool,
    pub progress: u8,
    pub progress_message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<SegmentationResult>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(case_id: impl Into<String>, fast_mode: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            case_id: case_id.into(),
            fast_mode,
            progress: 0,
            progress_message: "Queued".to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Seconds since the job started running, frozen at completion.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        let millis = (end - started).num_milliseconds().max(0);
        Some(millis as f64 / 1000.0)
    }
}
