//! # TELOS ANN - L2 Approximate Nearest-Neighbor Index
//!
//! A disk-resident graph index over concept embeddings keyed by concept id.
//! A single writer mutates the graph under a write lock; readers run
//! concurrently and observe either the pre- or post-mutation state, never a
//! partial one.
//!
//! Search contract: results are ordered by descending cosine similarity,
//! ties broken by ascending id; `threshold` filters results scoring below
//! it. Graph degree, beam width, and the pruning slack `alpha` are
//! configuration; they tune recall and build cost but do not affect the
//! contract.
//!
//! The index persists as its own file set (`index.meta` + `index.snapshot`)
//! under the data directory and is regenerable from L3 via
//! [`AnnIndex::rebuild_from`] if lost.

mod graph;
mod index;

pub use graph::cosine_similarity;
pub use index::{AnnIndex, AnnParams, AnnStats};

use telos_kernel::{ErrorKind, TelosError};
use thiserror::Error;

/// Result type for index operations
pub type AnnResult<T> = Result<T, AnnError>;

/// Errors raised by the ANN index
#[derive(Error, Debug)]
pub enum AnnError {
    /// Dimension mismatch or malformed argument
    #[error("invalid index operation: {0}")]
    Invalid(String),

    /// Snapshot file set could not be read or written
    #[error("index persistence failure: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for AnnError {
    fn from(err: std::io::Error) -> Self {
        AnnError::Persistence(err.to_string())
    }
}

impl From<AnnError> for TelosError {
    fn from(err: AnnError) -> Self {
        let kind = match &err {
            AnnError::Invalid(_) => ErrorKind::InvalidArgument,
            AnnError::Persistence(_) => ErrorKind::StorageFailure,
        };
        TelosError::new(kind, err.to_string())
    }
}
