//! Closed error taxonomy shared by every TELOS component
//!
//! Component crates define their own `thiserror` enums for internal
//! propagation and convert into [`TelosError`] at public boundaries, so
//! callers always match on the closed [`ErrorKind`] set. User-visible
//! failures carry the kind and a message; worker traces are attached only
//! when the caller opted into verbose reporting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for cross-component operations
pub type Result<T> = std::result::Result<T, TelosError>;

/// The closed set of error kinds recognized across all components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed request, unknown operation, or out-of-range parameter
    InvalidArgument,
    /// Component used before `initialize` or after `shutdown`
    NotInitialized,
    /// Handle refers to a segment that has been released
    HandleExpired,
    /// Bounded queue was full past the submission deadline
    QueueFull,
    /// Deadline expired before completion
    Timeout,
    /// Worker crashed and retries were exhausted
    WorkerLost,
    /// Worker reported a domain error
    WorkerError,
    /// Durable write failed; state is unchanged
    StorageFailure,
    /// Transaction lost a first-committer-wins race
    Conflict,
    /// Outbox record could not be propagated within its retry budget
    CoherenceFailure,
    /// No entry for the requested key
    NotFound,
    /// Operation cancelled cooperatively
    Cancelled,
    /// Iteration or wall-clock budget exhausted
    BudgetExhausted,
}

impl ErrorKind {
    /// Stable lower-snake name used in events and wire payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::HandleExpired => "handle_expired",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WorkerLost => "worker_lost",
            ErrorKind::WorkerError => "worker_error",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CoherenceFailure => "coherence_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BudgetExhausted => "budget_exhausted",
        }
    }

    /// Whether a caller may reasonably retry the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::QueueFull | ErrorKind::Timeout | ErrorKind::Conflict
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced at component boundaries
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TelosError {
    /// Which member of the closed set this failure is
    pub kind: ErrorKind,
    /// Human-readable context
    pub message: String,
    /// Worker stack trace, captured verbatim and never interpreted.
    /// Present only when the failing tier had one and verbose reporting
    /// is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TelosError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    /// Attach a verbatim worker trace
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Strip the trace for non-verbose reporting
    pub fn without_trace(mut self) -> Self {
        self.trace = None;
        self
    }

    /// Shorthand for `InvalidArgument`
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Shorthand for `NotFound`
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::QueueFull.as_str(), "queue_full");
        assert_eq!(ErrorKind::CoherenceFailure.as_str(), "coherence_failure");
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::QueueFull.is_transient());
        assert!(ErrorKind::Conflict.is_transient());
        assert!(!ErrorKind::WorkerLost.is_transient());
        assert!(!ErrorKind::StorageFailure.is_transient());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = TelosError::new(ErrorKind::Timeout, "deadline passed");
        assert_eq!(err.to_string(), "timeout: deadline passed");
    }

    #[test]
    fn trace_is_stripped_without_verbose() {
        let err = TelosError::new(ErrorKind::WorkerError, "panic in kernel")
            .with_trace("at vsa_bind (worker 3)");
        assert!(err.trace.is_some());
        assert!(err.without_trace().trace.is_none());
    }
}
