//! Test helper utilities: an in-process app instance, fake dataset cases
//! and fake adapter scripts standing in for the model process.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tempfile::TempDir;
use tokio::time::sleep;

use stroke_seg_api::app_state::AppState;
use stroke_seg_api::config::{AppConfig, InvokerKind};
use stroke_seg_api::models::JobStatusResponse;
use stroke_seg_api::routes;

use crate::fixtures;

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub state: AppState,
    pub data_dir: PathBuf,
    pub results_dir: PathBuf,
    pub scripts_dir: PathBuf,
    _tempdir: TempDir,
}

/// Start the full router on an ephemeral port. `configure` runs after the
/// test defaults are applied, so tests can override any knob.
pub async fn spawn_app(configure: impl FnOnce(&mut AppConfig)) -> TestApp {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let data_dir = tempdir.path().join("dataset");
    let results_dir = tempdir.path().join("results");
    let scripts_dir = tempdir.path().join("scripts");
    std::fs::create_dir_all(&data_dir).expect("data dir");
    std::fs::create_dir_all(&results_dir).expect("results dir");
    std::fs::create_dir_all(&scripts_dir).expect("scripts dir");

    let mut config: AppConfig = serde_json::from_str("{}").expect("default config");
    config.data_dir = data_dir.clone();
    config.results_dir = results_dir.clone();
    config.invoker = InvokerKind::Direct;
    // Tests drop an executable at this conventional path before submitting.
    config.adapter_command = scripts_dir.join("adapter.sh").display().to_string();
    config.max_concurrent_jobs = 2;
    config.inference_timeout_secs = 30;
    configure(&mut config);

    let invoker =
        stroke_seg_api::services::invoker::build_invoker(&config).expect("build invoker");
    let state = AppState::new(config, invoker);

    // Build an unregistered recorder handle so parallel tests do not fight
    // over the global metrics recorder.
    let prometheus = Arc::new(PrometheusBuilder::new().build_recorder().handle());
    let app = routes::router(state.clone(), prometheus);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test app");
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        state,
        data_dir,
        results_dir,
        scripts_dir,
        _tempdir: tempdir,
    }
}

/// Materialize a dataset case in BIDS-style layout.
pub fn write_case(data_dir: &Path, case_id: &str, with_ground_truth: bool) {
    let dir = data_dir.join(case_id);
    std::fs::create_dir_all(&dir).expect("case dir");
    fixtures::write_nifti_gz(
        &dir.join(format!("{case_id}_dwi.nii.gz")),
        &fixtures::DWI_VOXELS,
    );
    fixtures::write_nifti_gz(
        &dir.join(format!("{case_id}_adc.nii.gz")),
        &fixtures::ADC_VOXELS,
    );
    if with_ground_truth {
        fixtures::write_nifti_gz(
            &dir.join(format!("{case_id}_lesion-msk.nii.gz")),
            &fixtures::TRUTH_VOXELS,
        );
    }
}

/// Shell snippet that binds `$out` to the value after `--output`.
pub const PARSE_OUTPUT_ARG: &str = r#"out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
"#;

/// Write an executable adapter script the Direct invoker can spawn.
#[cfg(unix)]
pub fn write_adapter_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!("#!/usr/bin/env bash\nset -u\n{PARSE_OUTPUT_ARG}\n{body}\n");
    std::fs::write(&path, script).expect("write adapter script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod adapter script");
    path
}

/// An adapter that copies a canned prediction into the output folder.
#[cfg(unix)]
pub fn write_succeeding_adapter(scripts_dir: &Path) -> PathBuf {
    let prediction = scripts_dir.join("canned_prediction.nii.gz");
    fixtures::write_nifti_gz(&prediction, &fixtures::PREDICTION_VOXELS);
    write_adapter_script(
        scripts_dir,
        "adapter.sh",
        &format!("cp \"{}\" \"$out/lesion_msk.nii.gz\"", prediction.display()),
    )
}

/// Poll job status until completed or failed (with timeout).
pub async fn poll_job_until_terminal(
    app: &TestApp,
    job_id: &str,
    timeout_secs: u64,
) -> JobStatusResponse {
    let max_attempts = timeout_secs * 20; // Poll every 50ms
    for _ in 0..max_attempts {
        let response = app
            .client
            .get(format!("{}/api/jobs/{}", app.base_url, job_id))
            .send()
            .await
            .expect("poll request");
        assert!(
            response.status().is_success(),
            "poll returned {}",
            response.status()
        );
        let status: JobStatusResponse = response.json().await.expect("poll body");
        match status.status.to_string().as_str() {
            "completed" | "failed" => return status,
            _ => sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("job {job_id} did not reach a terminal state within {timeout_secs}s");
}

/// Submit a segmentation request and return the raw response.
pub async fn submit_case(app: &TestApp, case_id: &str) -> reqwest::Response {
    app.client
        .post(format!("{}/api/segment", app.base_url))
        .json(&serde_json::json!({ "caseId": case_id }))
        .send()
        .await
        .expect("submit request")
}

/// The pid recorded by a fake adapter must point at a reaped process.
#[cfg(unix)]
pub async fn assert_process_gone(pid_file: &Path) {
    let pid = std::fs::read_to_string(pid_file)
        .expect("pid file written")
        .trim()
        .to_string();
    let proc_entry = PathBuf::from(format!("/proc/{pid}"));
    for _ in 0..50 {
        if !proc_entry.exists() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("process {pid} still alive after kill");
}
