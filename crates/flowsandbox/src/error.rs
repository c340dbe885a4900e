use crate::SandboxId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to start sandbox worker {}: {source}", .worker.display())]
    Spawn {
        worker: PathBuf,
        source: std::io::Error,
    },

    #[error("Sandbox IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode sandbox request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Sandbox {0} is already running")]
    DuplicateId(SandboxId),

    #[error("Script evaluation panicked: {0}")]
    Panicked(String),

    #[error("Sandbox run was cancelled")]
    Cancelled,
}
