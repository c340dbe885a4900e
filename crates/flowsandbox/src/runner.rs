use crate::limits::{self, SandboxConfig, SandboxLimits};
use crate::protocol::{self, ReportStatus, SandboxRequest};
use crate::script::{self, FailureKind, ScriptOptions};
use crate::{Bindings, SandboxError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SandboxId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Success,
    Error,
    Timeout,
}

/// Outcome of one sandbox run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub status: SandboxStatus,
    pub output: Bindings,
    pub logs: Vec<String>,
    pub duration: Duration,
    pub error: Option<String>,
    pub traceback: Option<String>,
    /// Program output before the result frame, or everything if there was no frame
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Whether the evaluator delivered its own result, as opposed to the runner
    /// synthesizing one from how the process ended
    #[serde(default)]
    pub reported: bool,
}

impl SandboxResult {
    fn failed(error: String, duration: Duration) -> Self {
        Self {
            status: SandboxStatus::Error,
            output: Bindings::new(),
            logs: Vec::new(),
            duration,
            error: Some(error),
            traceback: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            pid: None,
            reported: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SandboxStatus::Success
    }
}

struct RunningSandbox {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
    pid: Option<u32>,
}

/// Deregisters a run and wakes `cancel` callers. Declared before the child so the
/// child is dropped (and killed) first.
struct RunGuard<'a> {
    running: &'a DashMap<SandboxId, RunningSandbox>,
    id: SandboxId,
    finished: watch::Sender<bool>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
        self.finished.send_replace(true);
    }
}

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    OutputExceeded,
}

#[derive(Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Runs code in worker processes under resource limits
pub struct SandboxRunner {
    config: SandboxConfig,
    running: DashMap<SandboxId, RunningSandbox>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn default_limits(&self) -> &SandboxLimits {
        &self.config.limits
    }

    pub async fn run(
        &self,
        code: &str,
        bindings: &Bindings,
        limits: &SandboxLimits,
    ) -> Result<SandboxResult, SandboxError> {
        self.run_with_id(SandboxId::new_v4(), code, bindings, limits, CancellationToken::new())
            .await
    }

    /// Run under a caller-chosen id. Cancelling `cancel`, or calling [`cancel`](Self::cancel)
    /// with the id, terminates the worker and yields `SandboxError::Cancelled`.
    pub async fn run_with_id(
        &self,
        id: SandboxId,
        code: &str,
        bindings: &Bindings,
        limits: &SandboxLimits,
        cancel: CancellationToken,
    ) -> Result<SandboxResult, SandboxError> {
        if self.running.contains_key(&id) {
            return Err(SandboxError::DuplicateId(id));
        }

        let marker = protocol::new_marker();
        let request = SandboxRequest {
            code: code.to_string(),
            bindings: bindings.clone(),
            marker: marker.clone(),
            memory_limit: limits.memory_bytes.map(|bytes| bytes as usize),
        };
        let payload = serde_json::to_vec(&request)?;

        let token = cancel.child_token();
        let (finished, finished_rx) = watch::channel(false);
        self.running.insert(
            id,
            RunningSandbox {
                cancel: token.clone(),
                finished: finished_rx,
                pid: None,
            },
        );
        let _guard = RunGuard {
            running: &self.running,
            id,
            finished,
        };

        let mut command = Command::new(&self.config.worker);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);
        limits::confine(&mut command, limits);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            worker: self.config.worker.clone(),
            source,
        })?;
        let pid = child.id();
        if let Some(mut entry) = self.running.get_mut(&id) {
            entry.pid = pid;
        }
        tracing::debug!(%id, ?pid, timeout_ms = limits.timeout_ms, "Sandbox worker started");

        let (exit, stdout, stderr) = supervise(&mut child, payload, limits, &token).await?;
        let duration = started.elapsed();

        let mut result = match exit {
            Exit::Cancelled => {
                tracing::info!(%id, ?pid, "Sandbox cancelled");
                return Err(SandboxError::Cancelled);
            }
            Exit::TimedOut => {
                tracing::warn!(%id, ?pid, timeout_ms = limits.timeout_ms, "Sandbox timed out");
                SandboxResult {
                    status: SandboxStatus::Timeout,
                    error: Some(format!("Execution timed out after {}ms", limits.timeout_ms)),
                    stdout: stdout.text.clone(),
                    ..SandboxResult::failed(String::new(), duration)
                }
            }
            Exit::OutputExceeded => SandboxResult::failed(
                format!("Output exceeded {} bytes", limits.max_output_bytes),
                duration,
            ),
            Exit::Exited(status) => match protocol::parse_report(&stdout.text, &marker) {
                Some((program_output, report)) if !stdout.truncated => SandboxResult {
                    status: match report.status {
                        ReportStatus::Success => SandboxStatus::Success,
                        ReportStatus::Error => SandboxStatus::Error,
                    },
                    output: report.output,
                    logs: report.logs,
                    duration,
                    error: report.error,
                    traceback: report.traceback,
                    stdout: program_output,
                    stderr: String::new(),
                    exit_code: status.code(),
                    pid: None,
                    reported: true,
                },
                _ => SandboxResult {
                    exit_code: status.code(),
                    stdout: stdout.text.clone(),
                    ..SandboxResult::failed(
                        format!("No execution result found (worker {})", status),
                        duration,
                    )
                },
            },
        };

        result.stderr = stderr.text;
        result.pid = pid;
        Ok(result)
    }

    /// Terminate a running sandbox. Returns once the worker process is gone;
    /// false if no run with this id is active.
    pub async fn cancel(&self, id: &SandboxId) -> bool {
        let finished = self.running.get(id).map(|entry| {
            entry.cancel.cancel();
            entry.finished.clone()
        });
        let Some(mut finished) = finished else {
            return false;
        };
        let _ = finished.wait_for(|done| *done).await;
        true
    }

    pub fn is_running(&self, id: &SandboxId) -> bool {
        self.running.contains_key(id)
    }

    pub fn pid(&self, id: &SandboxId) -> Option<u32> {
        self.running.get(id).and_then(|entry| entry.pid)
    }

    pub fn running(&self) -> Vec<SandboxId> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

async fn supervise(
    child: &mut Child,
    payload: Vec<u8>,
    limits: &SandboxLimits,
    cancel: &CancellationToken,
) -> Result<(Exit, Captured, Captured), SandboxError> {
    let overflow = CancellationToken::new();
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_capped(out, limits.max_output_bytes, overflow.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_capped(err, limits.max_output_bytes, overflow.clone())));

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // A worker that dies early closes the pipe; the exit status tells the story.
            if let Err(err) = stdin.write_all(&payload).await {
                tracing::debug!(error = %err, "Failed to write sandbox request");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let exit = tokio::select! {
        status = child.wait() => Exit::Exited(status?),
        _ = tokio::time::sleep(limits.timeout()) => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Cancelled,
        _ = overflow.cancelled() => Exit::OutputExceeded,
    };

    if !matches!(exit, Exit::Exited(_)) {
        terminate(child, limits.grace()).await?;
    }

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;
    Ok((exit, stdout, stderr))
}

/// SIGTERM, then SIGKILL once the grace period is over. Returns after the process is reaped.
async fn terminate(child: &mut Child, grace: Duration) -> Result<(), SandboxError> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
            if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                return Ok(());
            }
        }
    }

    if let Err(err) = child.kill().await {
        if child.try_wait()?.is_none() {
            return Err(err.into());
        }
    }
    Ok(())
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    overflow: CancellationToken,
) -> Captured {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
                if n > room {
                    truncated = true;
                    overflow.cancel();
                    break;
                }
            }
        }
    }
    Captured {
        text: String::from_utf8_lossy(&buf).into_owned(),
        truncated,
    }
}

async fn collect(task: Option<JoinHandle<Captured>>) -> Captured {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Captured::default(),
    }
}

/// Evaluate code on a blocking thread of this process.
///
/// Same result shape as [`SandboxRunner::run`], with the timeout and
/// cancellation enforced by an instruction hook instead of signals.
pub async fn run_inline(
    code: &str,
    bindings: &Bindings,
    limits: &SandboxLimits,
    cancel: &CancellationToken,
) -> Result<SandboxResult, SandboxError> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let options = ScriptOptions {
        deadline: Some(Instant::now() + limits.timeout()),
        interrupt: Some(interrupt.clone()),
        memory_limit: limits.memory_bytes.map(|bytes| bytes as usize),
        echo: false,
    };

    let started = Instant::now();
    let code = code.to_string();
    let bindings = bindings.clone();
    let mut task = tokio::task::spawn_blocking(move || script::evaluate(&code, &bindings, &options));

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = cancel.cancelled() => {
            interrupt.store(true, Ordering::Relaxed);
            (&mut task).await
        }
    };
    let duration = started.elapsed();

    let evaluated = joined.map_err(|err| SandboxError::Panicked(err.to_string()))?;
    match evaluated {
        Ok(outcome) => Ok(SandboxResult {
            status: SandboxStatus::Success,
            output: outcome.output,
            logs: outcome.logs,
            error: None,
            reported: true,
            ..SandboxResult::failed(String::new(), duration)
        }),
        Err(failure) => match failure.kind {
            FailureKind::Interrupted => Err(SandboxError::Cancelled),
            FailureKind::DeadlineExceeded => Ok(SandboxResult {
                status: SandboxStatus::Timeout,
                logs: failure.logs,
                error: Some(format!("Execution timed out after {}ms", limits.timeout_ms)),
                ..SandboxResult::failed(String::new(), duration)
            }),
            FailureKind::Error => Ok(SandboxResult {
                logs: failure.logs,
                traceback: failure.traceback,
                reported: true,
                ..SandboxResult::failed(failure.message, duration)
            }),
        },
    }
}
