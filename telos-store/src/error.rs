//! Store error types

use telos_kernel::{ErrorKind, TelosError};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the transactional store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Read-set validation failed; the caller may retry the transaction
    #[error("transaction conflict on {0}")]
    Conflict(String),

    /// The durable write failed; store state is unchanged
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Constraint violation (still-referenced delete, bad value)
    #[error("invalid store operation: {0}")]
    Invalid(String),

    /// No concept under the requested id
    #[error("concept {0} not found")]
    NotFound(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::StorageFailure(format!("record codec: {err}"))
    }
}

impl From<StoreError> for TelosError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::StorageFailure(_) => ErrorKind::StorageFailure,
            StoreError::Invalid(_) => ErrorKind::InvalidArgument,
            StoreError::NotFound(_) => ErrorKind::NotFound,
        };
        TelosError::new(kind, err.to_string())
    }
}
