//! Sandboxed code execution
//!
//! Runs untrusted Lua code in a separate worker process (`flow-sandbox`) under
//! OS resource limits, with a wall-clock timeout, graceful-then-forced
//! termination, and a marker-framed result protocol. The same evaluator can
//! also run inline on a blocking thread when isolation is not required.

mod error;
mod limits;
pub mod protocol;
mod runner;
pub mod script;

pub use error::SandboxError;
pub use limits::{default_worker_path, SandboxConfig, SandboxLimits, WORKER_ENV};
pub use runner::{run_inline, SandboxId, SandboxResult, SandboxRunner, SandboxStatus};

/// Named values injected into a script
pub type Bindings = serde_json::Map<String, serde_json::Value>;
