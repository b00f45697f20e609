//! Persisted record forms: stored concepts, changes, outbox records
//!
//! Concept records are stored as JSON (metadata slots carry arbitrary JSON
//! values); outbox records carry no open-ended values and use the compact
//! binary codec.

use serde::{Deserialize, Serialize};
use telos_kernel::{Concept, ConceptId};

/// A concept as persisted by L3: the concept, its materialized embedding,
/// and its record version for conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConcept {
    /// Record version, bumped on every committed mutation
    pub version: u64,
    /// The concept itself
    pub concept: Concept,
    /// Dense embedding materialized at write time, so L2 is regenerable
    /// from L3 alone
    pub vector: Option<Vec<f32>>,
}

/// Kind of committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// First write of an id
    Insert,
    /// Overwrite of an existing id
    Update,
    /// Removal of an id
    Delete,
}

/// One entry on the change subscription stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Gap-free sequence number
    pub sequence: u64,
    /// Mutated concept
    pub id: ConceptId,
    /// Mutation kind
    pub kind: ChangeKind,
    /// Post-mutation record; `None` for deletes
    pub snapshot: Option<StoredConcept>,
}

/// Cache tier targeted by an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// In-memory vector cache
    L1,
    /// On-disk ANN index
    L2,
}

/// Delivery state of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    /// Awaiting a coordinator lease
    Pending,
    /// Leased by a coordinator instance
    InFlight,
    /// Propagated to every target tier
    Applied,
    /// Retry budget exhausted; surfaced as a coherence failure
    Dead,
}

/// Durable propagation record, written in the same transaction as the
/// concept mutation it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Sequence number shared with the change stream; gap-free
    pub sequence: u64,
    /// Tiers this record must reach
    pub targets: Vec<Tier>,
    /// Mutation kind
    pub kind: ChangeKind,
    /// Mutated concept
    pub concept_id: ConceptId,
    /// Content hash of (kind, id, vector); the idempotence key for apply
    pub payload_hash: [u8; 32],
    /// Embedding to propagate; `None` for deletes and vector-less concepts
    pub vector: Option<Vec<f32>>,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Unix-ms timestamp before which the record must not be retried
    pub earliest_retry_ms: u64,
    /// Delivery state
    pub state: OutboxState,
    /// Unix-ms lease expiry while `InFlight`; 0 otherwise
    pub lease_until_ms: u64,
}

impl OutboxRecord {
    /// Compute the idempotence hash for a mutation payload
    pub fn hash_payload(kind: ChangeKind, id: ConceptId, vector: Option<&[f32]>) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[match kind {
            ChangeKind::Insert => 0u8,
            ChangeKind::Update => 1,
            ChangeKind::Delete => 2,
        }]);
        hasher.update(&id.as_u64().to_le_bytes());
        if let Some(vector) = vector {
            for v in vector {
                hasher.update(&v.to_le_bytes());
            }
        }
        *hasher.finalize().as_bytes()
    }

    /// Whether this record is eligible for a lease at `now_ms`: pending and
    /// past its retry time, or in flight with an expired lease.
    pub fn leasable(&self, now_ms: u64) -> bool {
        match self.state {
            OutboxState::Pending => self.earliest_retry_ms <= now_ms,
            OutboxState::InFlight => self.lease_until_ms <= now_ms,
            OutboxState::Applied | OutboxState::Dead => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_distinguishes_kind_and_vector() {
        let id = ConceptId(5);
        let a = OutboxRecord::hash_payload(ChangeKind::Update, id, Some(&[0.1, 0.2]));
        let b = OutboxRecord::hash_payload(ChangeKind::Update, id, Some(&[0.1, 0.3]));
        let c = OutboxRecord::hash_payload(ChangeKind::Delete, id, None);
        assert_ne!(a, b);
        assert_ne!(a, c);
        let again = OutboxRecord::hash_payload(ChangeKind::Update, id, Some(&[0.1, 0.2]));
        assert_eq!(a, again);
    }

    #[test]
    fn leasable_states() {
        let mut record = OutboxRecord {
            sequence: 1,
            targets: vec![Tier::L2, Tier::L1],
            kind: ChangeKind::Update,
            concept_id: ConceptId(1),
            payload_hash: [0; 32],
            vector: None,
            attempts: 0,
            earliest_retry_ms: 100,
            state: OutboxState::Pending,
            lease_until_ms: 0,
        };
        assert!(!record.leasable(50));
        assert!(record.leasable(100));

        record.state = OutboxState::InFlight;
        record.lease_until_ms = 200;
        assert!(!record.leasable(150));
        assert!(record.leasable(200));

        record.state = OutboxState::Applied;
        assert!(!record.leasable(u64::MAX));
    }

    #[test]
    fn outbox_record_binary_round_trip() {
        let record = OutboxRecord {
            sequence: 9,
            targets: vec![Tier::L2],
            kind: ChangeKind::Insert,
            concept_id: ConceptId(3),
            payload_hash: [7; 32],
            vector: Some(vec![1.0, -1.0]),
            attempts: 2,
            earliest_retry_ms: 1234,
            state: OutboxState::InFlight,
            lease_until_ms: 5678,
        };
        let bytes = bincode::serialize(&record).unwrap();
        let back: OutboxRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
