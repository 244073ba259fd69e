use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::database::DatabaseError;
use crate::runtime::RuntimeError;
use crate::workspace::WorkspaceError;

/// Daemon-wide error taxonomy. Every variant maps to a stable machine code
/// that clients can branch on; messages stay one-line and never echo env
/// values or file contents.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("image rejected by policy: {0}")]
    ImagePolicy(String),

    #[error("path escapes the workspace: {0}")]
    PathViolation(String),

    #[error("etag mismatch for {path}")]
    EtagConflict { path: String, expected: String, actual: String },

    #[error("container {0} is at its concurrent execution limit")]
    ConcurrencyLimit(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

impl DaemonError {
    /// Wrap an unexpected condition, logging the detail server-side and
    /// handing the client only a correlation id.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().simple().to_string();
        error!(correlation_id = %correlation_id, "internal error: {}", detail);
        DaemonError::Internal { correlation_id }
    }

    /// Stable machine code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::NotFound(_) => "not_found",
            DaemonError::AlreadyExists(_) => "already_exists",
            DaemonError::ImagePolicy(_) => "image_policy",
            DaemonError::PathViolation(_) => "path_violation",
            DaemonError::EtagConflict { .. } => "etag_conflict",
            DaemonError::ConcurrencyLimit(_) => "concurrency_limit",
            DaemonError::Timeout => "timeout",
            DaemonError::Cancelled => "cancelled",
            DaemonError::RuntimeUnavailable(_) => "runtime_unavailable",
            DaemonError::Runtime(_) => "runtime_error",
            DaemonError::InvalidRequest(_) => "invalid_request",
            DaemonError::ShuttingDown => "shutting_down",
            DaemonError::Internal { .. } => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::AlreadyExists(_) => StatusCode::CONFLICT,
            DaemonError::ImagePolicy(_) => StatusCode::FORBIDDEN,
            DaemonError::PathViolation(_) => StatusCode::FORBIDDEN,
            DaemonError::EtagConflict { .. } => StatusCode::PRECONDITION_FAILED,
            DaemonError::ConcurrencyLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            DaemonError::Timeout => StatusCode::REQUEST_TIMEOUT,
            DaemonError::Cancelled => StatusCode::CONFLICT,
            DaemonError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Runtime(_) => StatusCode::BAD_GATEWAY,
            DaemonError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DaemonError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
        }));

        (self.status(), body).into_response()
    }
}

impl From<RuntimeError> for DaemonError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(msg) => DaemonError::NotFound(msg),
            RuntimeError::Conflict(msg) => DaemonError::Runtime(msg),
            RuntimeError::Unavailable(msg) => DaemonError::RuntimeUnavailable(msg),
            RuntimeError::Api(msg) => DaemonError::Runtime(msg),
            RuntimeError::Io(e) => DaemonError::internal(e),
        }
    }
}

impl From<DatabaseError> for DaemonError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(msg) => DaemonError::NotFound(msg),
            DatabaseError::Conflict(msg) => DaemonError::AlreadyExists(msg),
            other => DaemonError::internal(other),
        }
    }
}

impl From<WorkspaceError> for DaemonError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::PathViolation(msg) => DaemonError::PathViolation(msg),
            WorkspaceError::NotFound(msg) => DaemonError::NotFound(msg),
            WorkspaceError::AlreadyExists(msg) => DaemonError::AlreadyExists(msg),
            WorkspaceError::EtagConflict { path, expected, actual } => {
                DaemonError::EtagConflict { path, expected, actual }
            }
            WorkspaceError::IsDirectory(msg) | WorkspaceError::NotADirectory(msg) => {
                DaemonError::InvalidRequest(msg)
            }
            WorkspaceError::Archive(msg) => DaemonError::InvalidRequest(msg),
            WorkspaceError::Io(e) => DaemonError::internal(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_codes_are_stable() {
        assert_eq!(DaemonError::NotFound("x".into()).code(), "not_found");
        assert_eq!(DaemonError::ConcurrencyLimit("c_1".into()).code(), "concurrency_limit");
        assert_eq!(
            DaemonError::EtagConflict {
                path: "/workspace/x".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .code(),
            "etag_conflict"
        );
        assert_eq!(DaemonError::internal("boom").code(), "internal");
    }

    #[test]
    fn test_runtime_error_normalization() {
        let e: DaemonError = RuntimeError::Unavailable("socket gone".into()).into();
        assert_eq!(e.code(), "runtime_unavailable");

        let e: DaemonError = RuntimeError::Api("500 from daemon".into()).into();
        assert_eq!(e.code(), "runtime_error");

        let e: DaemonError = RuntimeError::NotFound("no such container".into()).into();
        assert_eq!(e.code(), "not_found");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(DaemonError::PathViolation("..".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            DaemonError::RuntimeUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
