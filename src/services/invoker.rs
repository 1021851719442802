use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AppConfig, InvokerKind};
use crate::services::staging::{ADC_FILENAME, DWI_FILENAME, FLAIR_FILENAME};

/// Files the external computation must leave in its output directory.
/// A clean exit without every one of them, non-empty, is OutputMissing.
pub const EXPECTED_OUTPUT_FILES: &[&str] = &["lesion_msk.nii.gz"];

/// Cap on bytes retained per child stream. Both streams are still drained
/// to EOF past the cap; an unread pipe stalls the child and a dropped
/// handle kills it with SIGPIPE.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Longest stderr excerpt that may surface in a user-facing error.
const STDERR_EXCERPT_CHARS: usize = 600;

/// Progress callback: overall percent within the invocation plus a stage label.
pub type ProgressFn<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

/// Per-invocation options the pipeline passes through.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub job_id: Uuid,
    pub fast_mode: bool,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceStatus {
    Success,
    Timeout { limit: Duration },
    ProcessFailure { exit_code: i32, stderr_excerpt: String },
    OutputMissing { missing: String },
}

/// Normalized result of one invocation, independent of the strategy.
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub status: InferenceStatus,
    /// The expected-manifest files; populated only on Success.
    pub outputs: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Runs the external segmentation computation against a staged input folder
/// and normalizes its outcome. Exactly two implementations exist, selected
/// by configuration at startup; the pipeline depends only on this contract.
#[async_trait]
pub trait InferenceInvoker: Send + Sync {
    async fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        options: &InvokeOptions,
        progress: ProgressFn<'_>,
    ) -> Result<InferenceOutcome, InvokerError>;

    /// Short strategy label for logs and health output.
    fn name(&self) -> &'static str;
}

/// Select the configured strategy.
pub fn build_invoker(config: &AppConfig) -> Result<Arc<dyn InferenceInvoker>, InvokerError> {
    match config.invoker {
        InvokerKind::Docker => Ok(Arc::new(DockerInvoker::new(
            config.docker_image.clone(),
            config.use_gpu,
        ))),
        InvokerKind::Direct => Ok(Arc::new(DirectInvoker::from_command(
            &config.adapter_command,
        )?)),
    }
}

/// Launches the published model container with the input and output
/// directories bind-mounted. The container's own stdout is model chatter,
/// so this strategy reports no intermediate progress milestone.
pub struct DockerInvoker {
    image: String,
    use_gpu: bool,
}

impl DockerInvoker {
    pub fn new(image: impl Into<String>, use_gpu: bool) -> Self {
        Self {
            image: image.into(),
            use_gpu,
        }
    }

    fn command(
        &self,
        input_abs: &Path,
        output_abs: &Path,
        has_flair: bool,
        fast_mode: bool,
        container: &str,
    ) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", container]);
        if self.use_gpu {
            cmd.args(["--gpus", "all"]);
        }
        // Match the host user so output files are not root-owned.
        #[cfg(unix)]
        {
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
            cmd.arg("--user").arg(format!("{uid}:{gid}"));
        }
        cmd.arg("-v")
            .arg(format!("{}:/input", input_abs.display()))
            .arg("-v")
            .arg(format!("{}:/output", output_abs.display()))
            .arg(&self.image)
            .args(["--dwi_file_name", DWI_FILENAME])
            .args(["--adc_file_name", ADC_FILENAME]);
        if has_flair {
            cmd.args(["--flair_file_name", FLAIR_FILENAME]);
        }
        if fast_mode {
            cmd.args(["--fast", "True"]);
        }
        cmd
    }
}

#[async_trait]
impl InferenceInvoker for DockerInvoker {
    async fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        options: &InvokeOptions,
        _progress: ProgressFn<'_>,
    ) -> Result<InferenceOutcome, InvokerError> {
        tokio::fs::create_dir_all(output_dir).await?;
        // Bind mounts need absolute paths or docker treats them as volume names.
        let input_abs = tokio::fs::canonicalize(input_dir).await?;
        let output_abs = tokio::fs::canonicalize(output_dir).await?;
        let has_flair = tokio::fs::try_exists(input_abs.join(FLAIR_FILENAME)).await?;

        // Named so the kill path can reach the container itself; killing the
        // docker client alone leaves the container running under dockerd.
        let container = format!("seg-{}", options.job_id);
        let cmd = self.command(
            &input_abs,
            &output_abs,
            has_flair,
            options.fast_mode,
            &container,
        );

        let run = execute(cmd, options, None, Some(container.as_str())).await?;
        finalize_outcome(run, output_dir).await
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Runs the adapter script as a subprocess in the host environment,
/// bridging into the model's own interpreter. The adapter may emit JSON
/// progress lines on stdout, which are forwarded to the progress callback.
pub struct DirectInvoker {
    command: Vec<String>,
}

impl DirectInvoker {
    /// Build from a whitespace-separated command prefix, e.g.
    /// `conda run -n isles_ensemble python /app/deepisles_adapter.py`.
    pub fn from_command(adapter_command: &str) -> Result<Self, InvokerError> {
        let command: Vec<String> = adapter_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            return Err(InvokerError::EmptyAdapterCommand);
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl InferenceInvoker for DirectInvoker {
    async fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        options: &InvokeOptions,
        progress: ProgressFn<'_>,
    ) -> Result<InferenceOutcome, InvokerError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let input_abs = tokio::fs::canonicalize(input_dir).await?;
        let output_abs = tokio::fs::canonicalize(output_dir).await?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.arg("--dwi")
            .arg(input_abs.join(DWI_FILENAME))
            .arg("--adc")
            .arg(input_abs.join(ADC_FILENAME))
            .arg("--output")
            .arg(&output_abs);
        if tokio::fs::try_exists(input_abs.join(FLAIR_FILENAME)).await? {
            cmd.arg("--flair").arg(input_abs.join(FLAIR_FILENAME));
        }
        if options.fast_mode {
            cmd.arg("--fast");
        }

        let run = execute(cmd, options, Some(progress), None).await?;
        finalize_outcome(run, output_dir).await
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

struct RunResult {
    exit_code: Option<i32>,
    stderr: String,
    timed_out: bool,
    timeout: Duration,
    elapsed: Duration,
}

/// Spawn the child and drive it to completion: enforce the timeout (killing
/// and reaping the child, never abandoning it), react to cancellation the
/// same way, forward adapter progress lines when asked to, and capture a
/// bounded amount of stderr.
async fn execute(
    mut cmd: Command,
    options: &InvokeOptions,
    progress: Option<ProgressFn<'_>>,
    container: Option<&str>,
) -> Result<RunResult, InvokerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Commands like `conda run` fork the real worker; a dedicated process
    // group lets the kill below take the whole tree down.
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(InvokerError::Spawn)?;

    let stderr_task = tokio::spawn(drain_capped(child.stderr.take()));
    let mut stdout_lines = child.stdout.take().map(|h| BufReader::new(h).lines());
    let mut stdout_open = stdout_lines.is_some();
    let mut stdout_budget = MAX_CAPTURE_BYTES;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            _ = options.cancel.cancelled() => {
                kill_and_reap(&mut child, container).await;
                stderr_task.abort();
                return Err(InvokerError::Cancelled);
            }
            _ = &mut deadline => {
                kill_and_reap(&mut child, container).await;
                let stderr = join_capture(stderr_task).await;
                return Ok(RunResult {
                    exit_code: None,
                    stderr,
                    timed_out: true,
                    timeout: options.timeout,
                    elapsed: start.elapsed(),
                });
            }
            line = next_stdout_line(&mut stdout_lines), if stdout_open => {
                match line {
                    Some(text) => consume_stdout_line(&text, &mut stdout_budget, progress),
                    None => stdout_open = false,
                }
            }
            result = child.wait() => {
                break result?;
            }
        }
    };

    // The child may exit before its last buffered lines were read; drain
    // them so no progress report is dropped.
    while let Some(text) = next_stdout_line(&mut stdout_lines).await {
        consume_stdout_line(&text, &mut stdout_budget, progress);
    }

    let stderr = join_capture(stderr_task).await;
    Ok(RunResult {
        exit_code: Some(status.code().unwrap_or(-1)),
        stderr,
        timed_out: false,
        timeout: options.timeout,
        elapsed: start.elapsed(),
    })
}

/// Forward one adapter stdout line to the progress callback while the
/// retention budget lasts. Past the budget, lines are drained unparsed.
fn consume_stdout_line(text: &str, budget: &mut usize, progress: Option<ProgressFn<'_>>) {
    if *budget == 0 {
        return;
    }
    *budget = budget.saturating_sub(text.len() + 1);
    if let (Some(report), Some(update)) = (progress, parse_progress_line(text)) {
        report(
            update.percent.min(100),
            update.stage.as_deref().unwrap_or("Running inference..."),
        );
    }
}

/// Validate the expected-outputs manifest and assemble the outcome.
async fn finalize_outcome(
    run: RunResult,
    output_dir: &Path,
) -> Result<InferenceOutcome, InvokerError> {
    if run.timed_out {
        return Ok(InferenceOutcome {
            status: InferenceStatus::Timeout { limit: run.timeout },
            outputs: Vec::new(),
            elapsed: run.elapsed,
        });
    }
    match run.exit_code {
        Some(0) => match collect_expected_outputs(output_dir).await {
            Ok(outputs) => Ok(InferenceOutcome {
                status: InferenceStatus::Success,
                outputs,
                elapsed: run.elapsed,
            }),
            Err(missing) => Ok(InferenceOutcome {
                status: InferenceStatus::OutputMissing { missing },
                outputs: Vec::new(),
                elapsed: run.elapsed,
            }),
        },
        code => Ok(InferenceOutcome {
            status: InferenceStatus::ProcessFailure {
                exit_code: code.unwrap_or(-1),
                stderr_excerpt: stderr_excerpt(&run.stderr),
            },
            outputs: Vec::new(),
            elapsed: run.elapsed,
        }),
    }
}

/// Every manifest file must exist and be non-empty; Err carries the first
/// missing name.
async fn collect_expected_outputs(output_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut outputs = Vec::with_capacity(EXPECTED_OUTPUT_FILES.len());
    for name in EXPECTED_OUTPUT_FILES {
        let path = output_dir.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => outputs.push(path),
            _ => return Err((*name).to_string()),
        }
    }
    Ok(outputs)
}

async fn kill_and_reap(child: &mut Child, container: Option<&str>) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    }
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "Inference process already gone at kill");
    }
    if let Err(err) = child.wait().await {
        tracing::warn!(error = %err, "Failed to reap inference process");
    }
    if let Some(name) = container {
        kill_container(name).await;
    }
}

/// Killing the `docker run` client does not stop the container; dockerd owns
/// it. Take it down by name so the GPU actually frees up with the job slot.
async fn kill_container(name: &str) {
    let result = Command::new("docker")
        .args(["kill", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if !status.success() => {
            tracing::debug!(container = name, "Container already stopped at kill");
        }
        Err(err) => {
            tracing::warn!(container = name, error = %err, "Could not kill container");
        }
        _ => {}
    }
}

async fn next_stdout_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Drain a child stream to EOF, retaining only the first MAX_CAPTURE_BYTES.
async fn drain_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut kept = Vec::new();
    let Some(mut handle) = handle else {
        return kept;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES - kept.len();
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn join_capture(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    let bytes = task.await.unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Tail of the error stream, bounded so a failing process cannot flood a
/// user-facing message.
fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = chars[chars.len() - STDERR_EXCERPT_CHARS..].iter().collect();
    format!("...{tail}")
}

/// Progress line an adapter may print, e.g. `{"percent": 60, "stage": "Ensembling"}`.
#[derive(Debug, Deserialize)]
struct AdapterProgress {
    percent: u8,
    stage: Option<String>,
}

fn parse_progress_line(line: &str) -> Option<AdapterProgress> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("failed to launch inference process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("inference cancelled")]
    Cancelled,

    #[error("adapter command is empty")]
    EmptyAdapterCommand,

    #[error("inference io error: {0}")]
    Io(#[from] std::io::Error),
}
