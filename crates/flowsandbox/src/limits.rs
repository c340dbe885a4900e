use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the worker binary location
pub const WORKER_ENV: &str = "FLOW_SANDBOX_WORKER";

const WORKER_BIN: &str = "flow-sandbox";

/// Resource limits for one sandbox run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Wall-clock limit, always enforced by the runner
    pub timeout_ms: u64,
    /// Address-space ceiling
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    /// Largest file the worker may create
    pub file_size_bytes: Option<u64>,
    /// Cap on captured stdout and stderr, each
    pub max_output_bytes: usize,
    /// Time between the termination signal and the forced kill
    pub grace_ms: u64,
}

impl SandboxLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            memory_bytes: Some(1024 * 1024 * 1024),
            cpu_seconds: Some(300),
            file_size_bytes: Some(100 * 1024 * 1024),
            max_output_bytes: 10 * 1024 * 1024,
            grace_ms: 5_000,
        }
    }
}

/// Sandbox runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path of the worker executable
    pub worker: PathBuf,
    /// Limits applied when a caller does not pass its own
    pub limits: SandboxLimits,
}

impl SandboxConfig {
    pub fn with_worker(mut self, worker: impl Into<PathBuf>) -> Self {
        self.worker = worker.into();
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker: default_worker_path(),
            limits: SandboxLimits::default(),
        }
    }
}

/// `$FLOW_SANDBOX_WORKER`, else `flow-sandbox` next to the current executable
pub fn default_worker_path() -> PathBuf {
    if let Some(path) = std::env::var_os(WORKER_ENV) {
        return PathBuf::from(path);
    }
    let file_name = format!("{}{}", WORKER_BIN, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// Install OS-level limits on a command before it is spawned
#[cfg(unix)]
pub(crate) fn confine(command: &mut tokio::process::Command, limits: &SandboxLimits) {
    let limits = limits.clone();
    // SAFETY: the hook runs between fork and exec and only issues getrlimit/setrlimit,
    // which are async-signal-safe and do not allocate.
    unsafe {
        command.pre_exec(move || apply_rlimits(&limits));
    }
}

#[cfg(not(unix))]
pub(crate) fn confine(_command: &mut tokio::process::Command, _limits: &SandboxLimits) {}

#[cfg(unix)]
fn apply_rlimits(limits: &SandboxLimits) -> std::io::Result<()> {
    use nix::sys::resource::Resource;

    #[cfg(not(any(target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    if let Some(bytes) = limits.memory_bytes {
        lower_soft_limit(Resource::RLIMIT_AS, bytes)?;
    }
    if let Some(seconds) = limits.cpu_seconds {
        lower_soft_limit(Resource::RLIMIT_CPU, seconds)?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        lower_soft_limit(Resource::RLIMIT_FSIZE, bytes)?;
    }
    Ok(())
}

/// Lower the soft limit, never above the inherited hard limit
#[cfg(unix)]
fn lower_soft_limit(resource: nix::sys::resource::Resource, value: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource)?;
    let soft = std::cmp::min(hard, value as _);
    setrlimit(resource, soft, hard)?;
    Ok(())
}
