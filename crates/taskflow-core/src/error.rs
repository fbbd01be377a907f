use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error, Clone)]
pub enum TaskflowError {
    /// No template is registered under the requested name.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    /// No action is registered under the requested name.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// The caller supplied a malformed request.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The requested flow or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The task graph could not be persisted; nothing was written.
    #[error("flow expansion failed: {0}")]
    ExpansionFailed(String),
    /// A task's parameters could not be decoded into the action's shape.
    #[error("parameter decode failed: {0}")]
    ParameterDecodeFailed(String),
    /// The execution was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,
    /// The execution exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Startup-time configuration was inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
    /// Backend or other infrastructure failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Caller-facing error classes reported by the producer surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownTemplate,
    InvalidParameter,
    NotFound,
    Internal,
}

impl TaskflowError {
    /// Map this error onto the class an outer API layer reports to callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            TaskflowError::UnknownTemplate(_) => ErrorCode::UnknownTemplate,
            TaskflowError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            TaskflowError::NotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<crate::backend::BackendError> for TaskflowError {
    fn from(e: crate::backend::BackendError) -> Self {
        match e {
            crate::backend::BackendError::NotFound(what) => TaskflowError::NotFound(what),
            other => TaskflowError::Internal(format!("backend error: {other}")),
        }
    }
}

/// How the scheduler should treat a failed action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// May succeed if attempted again.
    Transient,
    /// Will never succeed; the task fails immediately.
    Permanent,
}

/// Error returned from an action body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?} action error: {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TaskflowError::UnknownTemplate("x".into()).code(),
            ErrorCode::UnknownTemplate
        );
        assert_eq!(
            TaskflowError::InvalidParameter("x".into()).code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(TaskflowError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(
            TaskflowError::ExpansionFailed("x".into()).code(),
            ErrorCode::Internal
        );
        assert_eq!(TaskflowError::Cancelled.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_backend_not_found_maps_to_not_found() {
        let err: TaskflowError = BackendError::NotFound("flow f1".into()).into();
        assert!(matches!(err, TaskflowError::NotFound(_)));
        let err: TaskflowError = BackendError::Io("down".into()).into();
        assert!(matches!(err, TaskflowError::Internal(_)));
    }
}
