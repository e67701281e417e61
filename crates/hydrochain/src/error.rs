//! Error types and categories.
//!
//! Every failure the machines can observe is sorted into an
//! [`ErrorCategory`]. Only [`ErrorCategory::Transient`] failures are retried;
//! everything else is reported as a fact and the Case decides what to do.

use crate::model::{CaseId, RunId, StudyId};
use thiserror::Error;

/// Semantic category of a failure, independent of its concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Scheduler command non-zero, HTTP 5xx, lock contention, timeouts.
    Transient,
    /// The collaborator answered and refused the request.
    Rejected,
    /// Input or output data could not be understood.
    Data,
    /// Broken invariant or unmapped state.
    Programmer,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Errors that can report their [`ErrorCategory`].
pub trait Categorizable {
    fn category(&self) -> ErrorCategory;
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl Categorizable for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Io(_) | StoreError::Backend(_) => ErrorCategory::Transient,
            StoreError::Encoding(_) => ErrorCategory::Data,
            StoreError::NotFound { .. } | StoreError::Constraint(_) => ErrorCategory::Programmer,
        }
    }
}

/// Scheduler command failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized scheduler output: {0}")]
    Unparseable(String),

    #[error("run {0} has no scheduler job id")]
    NotSubmitted(RunId),
}

impl Categorizable for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::CommandFailed { .. } | QueueError::Timeout { .. } => {
                ErrorCategory::Transient
            }
            QueueError::Spawn { .. } => ErrorCategory::Rejected,
            QueueError::Unparseable(_) => ErrorCategory::Data,
            QueueError::NotSubmitted(_) => ErrorCategory::Programmer,
        }
    }
}

/// Failures of the auxiliary HTTP services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("service unreachable: {0}")]
    Transport(String),

    #[error("service timed out")]
    Timeout,

    #[error("unexpected service payload: {0}")]
    Decode(String),

    #[error("service not configured: {0}")]
    Unconfigured(&'static str),
}

impl Categorizable for ServiceError {
    fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Status { status, .. } if *status >= 500 => ErrorCategory::Transient,
            ServiceError::Status { .. } | ServiceError::Unconfigured(_) => ErrorCategory::Rejected,
            ServiceError::Transport(_) | ServiceError::Timeout => ErrorCategory::Transient,
            ServiceError::Decode(_) => ErrorCategory::Data,
        }
    }
}

/// Errors surfaced by the machines and the driver loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration: {0}")]
    Config(String),

    #[error("study {0} not found")]
    StudyNotFound(StudyId),

    #[error("case {0} not found")]
    CaseNotFound(CaseId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("case list: {0}")]
    CaseList(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Categorizable for OrchestratorError {
    fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Store(e) => e.category(),
            OrchestratorError::Config(_) | OrchestratorError::CaseList(_) => ErrorCategory::Data,
            OrchestratorError::StudyNotFound(_)
            | OrchestratorError::CaseNotFound(_)
            | OrchestratorError::RunNotFound(_)
            | OrchestratorError::Invariant(_) => ErrorCategory::Programmer,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_status_category() {
        let server = ServiceError::Status {
            status: 503,
            body: "busy".into(),
        };
        let client = ServiceError::Status {
            status: 422,
            body: "bad case".into(),
        };
        assert!(server.category().is_retryable());
        assert_eq!(client.category(), ErrorCategory::Rejected);
    }

    #[test]
    fn test_queue_command_failure_is_transient() {
        let err = QueueError::CommandFailed {
            command: "qstat".into(),
            code: Some(1),
            stderr: "cannot reach qmaster".into(),
        };
        assert!(err.category().is_retryable());
        assert!(!QueueError::Unparseable("?".into()).category().is_retryable());
    }
}
