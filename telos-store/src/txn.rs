//! Transaction state
//!
//! A transaction buffers reads and writes on the caller's stack. Reads are
//! repeatable: the first read of an id caches the record and pins the
//! version the commit will validate against (first-committer-wins).
//! Nothing touches the database until `commit`.

use crate::record::StoredConcept;
use std::collections::BTreeMap;
use telos_kernel::{Concept, ConceptId};

/// Buffered write
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    /// Insert or overwrite, with an optionally refreshed embedding
    Put {
        concept: Concept,
        vector: Option<Vec<f32>>,
        /// Keep the previously stored vector when the put did not carry one
        keep_stored_vector: bool,
    },
    /// Remove the id
    Delete,
}

/// An open L3 transaction
#[derive(Debug, Default)]
pub struct Transaction {
    /// Change sequence at `begin`, for observability
    pub(crate) snapshot_sequence: u64,
    /// id -> (version observed at first read, cached record)
    pub(crate) reads: BTreeMap<ConceptId, (u64, Option<StoredConcept>)>,
    /// Buffered writes in application order (last write per id wins)
    pub(crate) writes: BTreeMap<ConceptId, WriteOp>,
    /// Set when the transaction has been aborted
    pub(crate) aborted: bool,
}

impl Transaction {
    pub(crate) fn new(snapshot_sequence: u64) -> Self {
        Self {
            snapshot_sequence,
            ..Self::default()
        }
    }

    /// The change sequence this transaction began at
    pub fn snapshot_sequence(&self) -> u64 {
        self.snapshot_sequence
    }

    /// Ids this transaction has read so far
    pub fn read_set(&self) -> impl Iterator<Item = ConceptId> + '_ {
        self.reads.keys().copied()
    }

    /// Ids this transaction will mutate on commit
    pub fn write_set(&self) -> impl Iterator<Item = ConceptId> + '_ {
        self.writes.keys().copied()
    }

    /// Whether the transaction has buffered mutations
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }
}
