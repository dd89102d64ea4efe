//! Error types for file operations.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors that stop a runner.
#[derive(Debug, Error)]
pub enum OpsError {
    /// The user chose Cancel at a conflict prompt.
    #[error("Operation aborted")]
    Aborted,

    /// The cancellation token was triggered.
    #[error("Operation cancelled")]
    Cancelled,

    /// Destination is equal to, or nested inside, a source.
    #[error("Cannot place {src} inside itself at {destination}")]
    InvalidOperation {
        src: PathBuf,
        destination: PathBuf,
    },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive could not be read or written.
    #[error("Archive error at {path}: {message}")]
    Archive { path: PathBuf, message: String },

    /// The operation is not supported for this path.
    #[error("{message}: {path}")]
    Unsupported { path: PathBuf, message: String },
}

impl OpsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an archive error with path context.
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The path the error is about, when it has one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Aborted | Self::Cancelled => None,
            Self::InvalidOperation { src, .. } => Some(src),
            Self::PermissionDenied { path }
            | Self::NotFound { path }
            | Self::Io { path, .. }
            | Self::Archive { path, .. }
            | Self::Unsupported { path, .. } => Some(path),
        }
    }
}

/// A non-fatal, per-path failure recorded on the progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}
