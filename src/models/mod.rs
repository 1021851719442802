pub mod job;
pub mod segment;

pub use job::{Job, JobStatus};
pub use segment::{
    CasesResponse, CreateJobResponse, JobStatusResponse, SegmentRequest, SegmentationResult,
};
