//! Workspace error types

use thiserror::Error;

/// Errors that can occur during workspace operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Path escapes the workspace root
    #[error("path violation: {0}")]
    PathViolation(String),

    /// File or directory not found
    #[error("not found: {0}")]
    NotFound(String),

    /// File or directory already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("etag mismatch for {path}")]
    EtagConflict {
        path: String,
        expected: String,
        actual: String,
    },

    /// Operation needs a file but found a directory
    #[error("{0}")]
    IsDirectory(String),

    /// Operation needs a directory but found a file
    #[error("{0}")]
    NotADirectory(String),

    /// Archive encode/decode failure
    #[error("archive error: {0}")]
    Archive(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for workspace operations
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
