/// Failure taxonomy for backup and restore runs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteBackupError {
    #[error("`{program}` exited with {status}: {output}")]
    Subprocess {
        program: String,
        status: String,
        output: String,
    },

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage request failed during {operation}: {message}")]
    Storage { operation: &'static str, message: String },

    #[error("MD5 check failed for {}: local md5 {local} does not match remote ETag {remote}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        local: String,
        remote: String,
    },

    #[error("not enough free disk space: need {needed} bytes, {available} bytes available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("refusing to remove {}", .0.display())]
    UnsafeRemoval(PathBuf),

    #[error("restore aborted by user")]
    Aborted,
}

impl SiteBackupError {
    pub fn storage(operation: &'static str, err: impl std::fmt::Display) -> Self {
        SiteBackupError::Storage {
            operation,
            message: err.to_string(),
        }
    }
}
