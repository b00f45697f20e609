//! Coherence event stream

use serde::{Deserialize, Serialize};
use telos_kernel::ConceptId;

/// Events emitted by the coherence coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoherenceEvent {
    /// An outbox record reached every target tier
    Applied {
        /// Outbox sequence number
        sequence: u64,
        /// Concept the record was for
        id: ConceptId,
    },
    /// An outbox record exhausted its retry budget and was dead-lettered
    CoherenceFailure {
        /// Outbox sequence number
        sequence: u64,
        /// Concept the record was for
        id: ConceptId,
        /// Delivery attempts made
        attempts: u32,
        /// Last apply error
        message: String,
    },
    /// A vector was promoted into L1 by the usage policy
    Promoted {
        /// Concept whose vector was promoted
        id: ConceptId,
    },
}
