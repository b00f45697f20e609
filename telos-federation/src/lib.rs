//! # TELOS Federation - Coherence Coordinator & Memory Fabric
//!
//! Glues the three memory tiers into one federated fabric:
//!
//! - **L1** ([`telos_cache::VectorCache`]): in-memory vectors
//! - **L2** ([`telos_ann::AnnIndex`]): on-disk ANN index
//! - **L3** ([`telos_store::ConceptStore`]): transactional concept graph
//!
//! The write path goes through L3 only; the coherence coordinator consumes
//! the transactional outbox and propagates each change to L2 and L1
//! exactly-once-effectively (at-least-once delivery plus idempotent apply
//! keyed by payload hash). Within one concept id the hops are linearizable:
//! a reader that observes a post-mutation L3 snapshot will, after the
//! coherence hop completes, observe a matching or empty L2/L1 entry, never
//! a stale positive one.

pub mod coordinator;
pub mod events;
pub mod fabric;

pub use coordinator::{CoherenceCoordinator, CoordinatorStats};
pub use events::CoherenceEvent;
pub use fabric::{FabricStats, FederatedMemory};

/// Vectors of concepts used more often than this are promoted into L1 on a
/// cache miss served by a lower tier.
pub const PROMOTION_USAGE_THRESHOLD: u64 = 3;
