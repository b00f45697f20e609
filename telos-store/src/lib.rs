//! # TELOS Store - Transactional Object Store (L3)
//!
//! A single-writer, many-reader keyed store over [`telos_kernel::Concept`],
//! persisted in sled. Commits are serializable (repeatable reads validated
//! first-committer-wins under the writer lock), atomic, and durable before
//! `commit` returns. There is no mode in which mutations are visible
//! without being durable.
//!
//! Every successful commit appends one change record per mutated concept to
//! the subscription stream with a gap-free sequence number, and writes one
//! outbox record per mutation *in the same sled transaction* as the concept
//! mutation - the transactional outbox pattern. The coherence coordinator
//! consumes the outbox tree; `applied` records are never reread.

pub mod error;
pub mod record;
pub mod store;
pub mod txn;

pub use error::{StoreError, StoreResult};
pub use record::{
    Change, ChangeKind, OutboxRecord, OutboxState, StoredConcept, Tier,
};
pub use store::{ConceptStore, StoreStats};
pub use txn::Transaction;
