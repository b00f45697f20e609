//! Bridge error taxonomy
//!
//! Worker-domain failures are translated into this closed set at the
//! bridge boundary. Worker stack traces, when available, are captured
//! verbatim in `WorkerError` but never interpreted.

use telos_kernel::{ErrorKind, TelosError};
use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// The closed bridge error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Task failed validation before queueing
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A referenced handle is no longer live
    #[error("handle expired: {0}")]
    HandleExpired(String),

    /// Worker crashed and the retry budget is exhausted
    #[error("worker lost after {attempts} attempt(s)")]
    WorkerLost {
        /// Executions attempted, including the original submission
        attempts: u32,
    },

    /// Deadline expired while queued or in flight
    #[error("task timed out")]
    Timeout,

    /// Bounded queue stayed full past the submission deadline
    #[error("task queue full")]
    QueueFull,

    /// Bridge is not initialized or already shut down
    #[error("bridge is down")]
    BridgeDown,

    /// Task cancelled by shutdown or explicit cancel
    #[error("task cancelled")]
    Cancelled,

    /// Worker reported a domain error; message carried verbatim
    #[error("worker error: {message}")]
    WorkerError {
        /// Worker-provided message or captured panic payload
        message: String,
    },
}

impl BridgeError {
    /// Stable wire tag for the response envelope
    pub fn wire_kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidTask(_) => "invalid_task",
            BridgeError::HandleExpired(_) => "handle_expired",
            BridgeError::WorkerLost { .. } => "worker_lost",
            BridgeError::Timeout => "timeout",
            BridgeError::QueueFull => "queue_full",
            BridgeError::BridgeDown => "bridge_down",
            BridgeError::Cancelled => "cancelled",
            BridgeError::WorkerError { .. } => "worker_error",
        }
    }
}

impl From<telos_shm::ShmError> for BridgeError {
    fn from(err: telos_shm::ShmError) -> Self {
        match err {
            telos_shm::ShmError::HandleExpired(name) => BridgeError::HandleExpired(name),
            other => BridgeError::InvalidTask(other.to_string()),
        }
    }
}

impl From<BridgeError> for TelosError {
    fn from(err: BridgeError) -> Self {
        let kind = match &err {
            BridgeError::InvalidTask(_) => ErrorKind::InvalidArgument,
            BridgeError::HandleExpired(_) => ErrorKind::HandleExpired,
            BridgeError::WorkerLost { .. } => ErrorKind::WorkerLost,
            BridgeError::Timeout => ErrorKind::Timeout,
            BridgeError::QueueFull => ErrorKind::QueueFull,
            BridgeError::BridgeDown => ErrorKind::NotInitialized,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::WorkerError { .. } => ErrorKind::WorkerError,
        };
        TelosError::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kinds_are_stable() {
        assert_eq!(BridgeError::Timeout.wire_kind(), "timeout");
        assert_eq!(BridgeError::BridgeDown.wire_kind(), "bridge_down");
        assert_eq!(
            BridgeError::WorkerLost { attempts: 3 }.wire_kind(),
            "worker_lost"
        );
    }

    #[test]
    fn maps_into_closed_kernel_kinds() {
        let err: TelosError = BridgeError::QueueFull.into();
        assert_eq!(err.kind, ErrorKind::QueueFull);
        let err: TelosError = BridgeError::BridgeDown.into();
        assert_eq!(err.kind, ErrorKind::NotInitialized);
    }
}
