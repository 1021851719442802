//! Job registry behavior: atomic admission under contention, monotonic
//! progress, one-shot terminal transitions and TTL eviction.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use stroke_seg_api::models::{JobStatus, SegmentationResult};
use stroke_seg_api::services::job_store::{
    run_ttl_sweeper, CancelOutcome, JobStore, JobStoreError,
};
use tokio_util::sync::CancellationToken;

fn sample_result(case_id: &str) -> SegmentationResult {
    SegmentationResult {
        case_id: case_id.to_string(),
        dice_score: Some(0.5),
        volume_ml: Some(0.004),
        elapsed_seconds: 1.25,
        dwi_url: format!("/files/job/{case_id}/dwi.nii.gz"),
        prediction_url: format!("/files/job/{case_id}/lesion_msk.nii.gz"),
        warnings: Vec::new(),
    }
}

#[tokio::test]
async fn admission_never_exceeds_the_limit_under_contention() {
    let store = Arc::new(JobStore::new());
    let limit = 3;

    let submissions = (0..32).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store.create_job_if_under_limit(&format!("case-{i}"), true, limit)
        })
    });
    let results = join_all(submissions).await;

    let admitted = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(JobStoreError::CapacityExceeded { .. }))))
        .count();

    assert_eq!(admitted, limit);
    assert_eq!(rejected, 32 - limit);
    assert_eq!(store.active_count(), limit);
}

#[tokio::test]
async fn slots_free_up_once_jobs_reach_a_terminal_state() {
    let store = JobStore::new();

    let first = store
        .create_job_if_under_limit("sub-a", true, 1)
        .expect("first admission");
    assert!(matches!(
        store.create_job_if_under_limit("sub-b", true, 1),
        Err(JobStoreError::CapacityExceeded { active: 1, limit: 1 })
    ));

    store
        .complete_job(first.id, sample_result("sub-a"))
        .expect("complete first");

    // Terminal jobs stay readable but no longer occupy a slot.
    assert_eq!(store.active_count(), 0);
    assert_eq!(store.len(), 1);
    store
        .create_job_if_under_limit("sub-b", true, 1)
        .expect("admission after completion");
}

#[tokio::test]
async fn progress_only_moves_forward_and_is_clamped() {
    let store = JobStore::new();
    let job = store
        .create_job_if_under_limit("sub-a", true, 2)
        .expect("admit");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);

    store.update_progress(job.id, 10, "Loading case data...");
    let running = store.get_job(job.id).expect("job exists");
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.started_at.is_some());
    assert_eq!(running.progress, 10);

    store.update_progress(job.id, 50, "Running inference...");
    // A late, lower report may not move the bar backwards.
    store.update_progress(job.id, 30, "Still running");
    let current = store.get_job(job.id).expect("job exists");
    assert_eq!(current.progress, 50);
    assert_eq!(current.progress_message, "Still running");

    store.update_progress(job.id, 150, "Overshooting");
    assert_eq!(store.get_job(job.id).expect("job exists").progress, 100);
}

#[tokio::test]
async fn completion_is_terminal_exactly_once() {
    let store = JobStore::new();
    let job = store
        .create_job_if_under_limit("sub-a", false, 2)
        .expect("admit");

    store
        .complete_job(job.id, sample_result("sub-a"))
        .expect("first completion");
    let done = store.get_job(job.id).expect("job exists");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.progress_message, "Segmentation complete");
    assert!(done.completed_at.is_some());
    assert!(done.result.is_some());

    assert!(matches!(
        store.complete_job(job.id, sample_result("sub-a")),
        Err(JobStoreError::AlreadyTerminal(_))
    ));
    assert!(matches!(
        store.fail_job(job.id, "too late"),
        Err(JobStoreError::AlreadyTerminal(_))
    ));

    // Late progress reports are ignored after the terminal transition.
    store.update_progress(job.id, 10, "stale update");
    let after = store.get_job(job.id).expect("job exists");
    assert_eq!(after.progress, 100);
    assert_eq!(after.progress_message, "Segmentation complete");
}

#[tokio::test]
async fn failure_freezes_progress_and_records_the_error() {
    let store = JobStore::new();
    let job = store
        .create_job_if_under_limit("sub-a", true, 2)
        .expect("admit");

    store.update_progress(job.id, 30, "Running inference...");
    store
        .fail_job(job.id, "inference process failed (exit code 3): boom")
        .expect("fail");

    let failed = store.get_job(job.id).expect("job exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.progress, 30);
    assert_eq!(failed.progress_message, "Error occurred");
    assert!(failed
        .error
        .as_deref()
        .expect("error recorded")
        .contains("exit code 3"));
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn cancel_signals_active_jobs_only() {
    let store = JobStore::new();
    let job = store
        .create_job_if_under_limit("sub-a", true, 2)
        .expect("admit");
    let token = store.cancel_token(job.id).expect("token exists");
    assert!(!token.is_cancelled());

    assert_eq!(store.cancel_job(job.id), CancelOutcome::Signalled);
    assert!(token.is_cancelled());

    store.fail_job(job.id, "job cancelled by user").expect("fail");
    assert_eq!(store.cancel_job(job.id), CancelOutcome::AlreadyTerminal);
    assert_eq!(
        store.cancel_job(uuid::Uuid::new_v4()),
        CancelOutcome::NotFound
    );
}

#[tokio::test]
async fn eviction_drops_old_jobs_and_cancels_their_tokens() {
    let store = JobStore::new();
    let job = store
        .create_job_if_under_limit("sub-a", true, 4)
        .expect("admit");
    let token = store.cancel_token(job.id).expect("token exists");

    // Nothing is old enough yet.
    assert!(store.evict_expired(chrono::Duration::hours(1)).is_empty());
    assert_eq!(store.len(), 1);

    // With a zero TTL everything is expired, regardless of status.
    let evicted = store.evict_expired(chrono::Duration::zero());
    assert_eq!(evicted, vec![job.id]);
    assert!(store.get_job(job.id).is_none());
    assert!(token.is_cancelled());
    assert_eq!(store.active_count(), 0);
}

#[tokio::test]
async fn ttl_sweeper_removes_job_records_and_result_files() {
    let store = Arc::new(JobStore::new());
    let results_dir = tempfile::tempdir().expect("tempdir");

    let job = store
        .create_job_if_under_limit("sub-a", true, 2)
        .expect("admit");
    let job_dir = results_dir.path().join(job.id.to_string());
    std::fs::create_dir_all(job_dir.join("sub-a")).expect("job dir");
    std::fs::write(job_dir.join("sub-a").join("lesion_msk.nii.gz"), b"mask").expect("artifact");

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_ttl_sweeper(
        store.clone(),
        chrono::Duration::zero(),
        Duration::from_millis(50),
        results_dir.path().to_path_buf(),
        cancel.clone(),
    ));

    // Give the sweeper a few ticks to evict and clean up.
    for _ in 0..40 {
        if store.is_empty() && !job_dir.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(store.is_empty(), "job record survived the sweep");
    assert!(!job_dir.exists(), "result files survived the sweep");

    cancel.cancel();
    handle.await.expect("sweeper task");
}
