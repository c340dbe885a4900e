//! Wire format between the runner and the worker process.
//!
//! The runner writes one JSON [`SandboxRequest`] to the worker's stdin. The
//! worker writes whatever the program prints, then the request's marker on a
//! line of its own, then one JSON [`WorkerReport`]. The marker carries a fresh
//! nonce per run, so program output cannot forge or corrupt the report.

use crate::Bindings;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MARKER_PREFIX: &str = "===FLOW_SANDBOX_RESULT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub code: String,
    #[serde(default)]
    pub bindings: Bindings,
    pub marker: String,
    #[serde(default)]
    pub memory_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub output: Bindings,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl WorkerReport {
    pub fn success(output: Bindings, logs: Vec<String>) -> Self {
        Self {
            status: ReportStatus::Success,
            output,
            logs,
            error: None,
            traceback: None,
        }
    }

    pub fn failure(error: String, traceback: Option<String>, logs: Vec<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            output: Bindings::new(),
            logs,
            error: Some(error),
            traceback,
        }
    }
}

pub fn new_marker() -> String {
    format!("{}:{}===", MARKER_PREFIX, Uuid::new_v4().simple())
}

/// Result frame as the worker prints it
pub fn encode_report(marker: &str, report: &WorkerReport) -> Result<String, serde_json::Error> {
    Ok(format!("\n{}\n{}\n", marker, serde_json::to_string(report)?))
}

/// Split worker stdout into the program's own output and the final report.
/// `None` if the marker is missing or the frame after it is not a report.
pub fn parse_report(stdout: &str, marker: &str) -> Option<(String, WorkerReport)> {
    let at = stdout.rfind(marker)?;
    let report = serde_json::from_str(stdout[at + marker.len()..].trim()).ok()?;
    Some((stdout[..at].trim_end().to_string(), report))
}
