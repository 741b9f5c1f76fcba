//! Error taxonomy shared by every component above the state layer.
//!
//! Every failure is classified into one of four kinds before it crosses a
//! component boundary. The gateway serializes these kinds; it never adds
//! its own.

use serde::{Deserialize, Serialize};
use servcur_state::StorageError;

/// Classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    RuntimeUnavailable,
    InvalidRequest,
}

impl ErrorKind {
    /// Only transient backend failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RuntimeUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// servcur domain errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Resource, job or project absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate active job, resource busy, state already reached.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport or backend down; transient.
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Malformed request, unsupported verb for a kind.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            CoreError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            CoreError::NotFound(m)
            | CoreError::Conflict(m)
            | CoreError::RuntimeUnavailable(m)
            | CoreError::InvalidRequest(m) => m,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Same kind, rewritten message.
    pub fn map_message(self, f: impl FnOnce(String) -> String) -> Self {
        match self {
            CoreError::NotFound(m) => CoreError::NotFound(f(m)),
            CoreError::Conflict(m) => CoreError::Conflict(f(m)),
            CoreError::RuntimeUnavailable(m) => CoreError::RuntimeUnavailable(f(m)),
            CoreError::InvalidRequest(m) => CoreError::InvalidRequest(f(m)),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        let msg = err.to_string();
        match err {
            StorageError::JobNotFound { .. } | StorageError::ProjectNotFound { .. } => {
                CoreError::NotFound(msg)
            }
            StorageError::AlreadyActive { .. } | StorageError::InvalidTransition { .. } => {
                CoreError::Conflict(msg)
            }
            StorageError::Io(_) | StorageError::Serialization(_) => {
                CoreError::RuntimeUnavailable(msg)
            }
        }
    }
}

/// Result type for servcur domain operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use servcur_state::{JobCommand, JobState};

    #[test]
    fn only_runtime_unavailable_is_retryable() {
        assert!(ErrorKind::RuntimeUnavailable.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn storage_errors_are_classified() {
        let err: CoreError = StorageError::AlreadyActive {
            project: "web/main".into(),
            command: JobCommand::Start,
            active: "abc".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.message().contains("web/main"));

        let err: CoreError = StorageError::InvalidTransition {
            io_id: "abc".into(),
            from: JobState::Succeeded,
            to: JobState::Running,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: CoreError = StorageError::JobNotFound { io_id: "x".into() }.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CoreError = StorageError::Io(io).into();
        assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RuntimeUnavailable).unwrap();
        assert_eq!(json, "\"runtime_unavailable\"");
    }
}
