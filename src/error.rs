use std::{io, path::PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Error, Debug)]
pub enum DeployError {
    /// Explicit abort requested by the user. Not a failure.
    #[error("deployment canceled by user")]
    Cancelled,

    #[error("deployment aborted: {reason}")]
    ProcessCanceled { reason: String },

    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error(
        "{count} file(s) could not be deployed or removed. \
         They are most likely locked by another application (is the game running?)"
    )]
    LockedFiles { count: usize },

    #[error("failed to merge archive {}: {reason}", path.display())]
    ArchiveMerge { path: PathBuf, reason: String },

    #[error("deployment method {id} is not supported: {reason}")]
    UnsupportedMethod { id: String, reason: String },

    #[error("unknown deployment method: {0}")]
    UnknownMethod(String),

    #[error("game not found at {}: missing {missing}", root.display())]
    GameNotFound { root: PathBuf, missing: String },

    #[error("invalid deployment manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeployError {
    pub fn archive_merge(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        DeployError::ArchiveMerge {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeployError::Cancelled
                | DeployError::ProcessCanceled { .. }
                | DeployError::LockedFiles { .. }
        )
    }
}

/// Absent files are an acceptable outcome for removals.
pub fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}
