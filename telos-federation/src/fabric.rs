//! The federated memory facade
//!
//! Read-through access across the tiers: L1 first, then L2, then the
//! canonical L3 record. Misses served by a lower tier go through the
//! coordinator's promotion policy. All writes go through L3 transactions;
//! the outbox keeps the caches coherent.

use crate::coordinator::CoherenceCoordinator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use telos_ann::{AnnIndex, AnnStats};
use telos_cache::{CacheStats, VectorCache};
use telos_kernel::{Concept, ConceptId, Result as KernelResult, TelosError};
use telos_store::ConceptStore;
use tracing::instrument;

/// Combined tier counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FabricStats {
    /// L1 cache counters
    pub l1: CacheStats,
    /// L2 index counters
    pub l2: AnnStats,
    /// Concepts stored in L3
    pub l3_concepts: usize,
    /// Last committed L3 sequence
    pub l3_sequence: u64,
    /// Outbox records awaiting propagation
    pub outbox_pending: usize,
    /// Outbox records dead-lettered
    pub outbox_dead: usize,
}

/// Read/write facade over the three memory tiers.
///
/// Cheap to clone; clones share the same tiers.
#[derive(Clone)]
pub struct FederatedMemory {
    store: ConceptStore,
    index: AnnIndex,
    cache: VectorCache,
    coordinator: CoherenceCoordinator,
}

impl FederatedMemory {
    /// Assemble the facade over live tiers
    pub fn new(
        store: ConceptStore,
        index: AnnIndex,
        cache: VectorCache,
        coordinator: CoherenceCoordinator,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            coordinator,
        }
    }

    /// The underlying L3 store
    pub fn store(&self) -> &ConceptStore {
        &self.store
    }

    /// The underlying L2 index
    pub fn index(&self) -> &AnnIndex {
        &self.index
    }

    /// The underlying L1 cache
    pub fn cache(&self) -> &VectorCache {
        &self.cache
    }

    /// The coherence coordinator
    pub fn coordinator(&self) -> &CoherenceCoordinator {
        &self.coordinator
    }

    /// Read a concept's dense vector through the tier hierarchy
    #[instrument(skip(self), level = "debug")]
    pub fn read_vector(&self, id: ConceptId) -> KernelResult<Option<Arc<Vec<f32>>>> {
        if let Some(vector) = self.cache.get(id) {
            return Ok(Some(vector));
        }

        if let Some(vector) = self.index.vector_of(id) {
            self.maybe_promote(id, &vector)?;
            return Ok(Some(Arc::new(vector)));
        }

        let record = self.store.read_committed(id).map_err(TelosError::from)?;
        match record.and_then(|r| r.vector) {
            Some(vector) => {
                self.maybe_promote(id, &vector)?;
                Ok(Some(Arc::new(vector)))
            }
            None => Ok(None),
        }
    }

    fn maybe_promote(&self, id: ConceptId, vector: &[f32]) -> KernelResult<()> {
        let usage = self
            .store
            .read_committed(id)
            .map_err(TelosError::from)?
            .map(|r| r.concept.usage_count)
            .unwrap_or(0);
        self.coordinator.promote(id, usage, vector);
        Ok(())
    }

    /// Read the canonical concept from L3
    pub fn concept(&self, id: ConceptId) -> KernelResult<Option<Concept>> {
        Ok(self
            .store
            .read_committed(id)
            .map_err(TelosError::from)?
            .map(|r| r.concept))
    }

    /// Write a concept (and optionally its refreshed embedding) through an
    /// L3 transaction. Returns the committed change sequence.
    #[instrument(skip(self, concept, vector), fields(id = %concept.id))]
    pub async fn write_concept(
        &self,
        concept: Concept,
        vector: Option<Vec<f32>>,
    ) -> KernelResult<u64> {
        let mut txn = self.store.begin();
        match vector {
            Some(v) => self
                .store
                .put_with_vector(&mut txn, concept, Some(v))
                .map_err(TelosError::from)?,
            None => self.store.put(&mut txn, concept).map_err(TelosError::from)?,
        }
        self.store.commit(txn).await.map_err(TelosError::from)
    }

    /// Delete a concept through an L3 transaction
    pub async fn delete_concept(&self, id: ConceptId) -> KernelResult<u64> {
        let mut txn = self.store.begin();
        self.store.delete(&mut txn, id).map_err(TelosError::from)?;
        self.store.commit(txn).await.map_err(TelosError::from)
    }

    /// Bump a concept's usage counter inside an L3 transaction
    pub async fn record_usage(&self, id: ConceptId) -> KernelResult<()> {
        let mut txn = self.store.begin();
        let Some(mut concept) = self.store.get(&mut txn, id).map_err(TelosError::from)? else {
            return Err(TelosError::not_found(id.to_string()));
        };
        concept.record_usage();
        self.store.put(&mut txn, concept).map_err(TelosError::from)?;
        self.store.commit(txn).await.map_err(TelosError::from)?;
        Ok(())
    }

    /// Approximate nearest-neighbor search over L2
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> KernelResult<Vec<(ConceptId, f32)>> {
        self.index.search(query, k, threshold).map_err(TelosError::from)
    }

    /// Regenerate L2 from an L3 scan (recovery path)
    pub fn rebuild_index(&self) -> KernelResult<usize> {
        let entries: Vec<(ConceptId, Vec<f32>)> = self
            .store
            .scan()
            .map_err(TelosError::from)?
            .into_iter()
            .filter_map(|r| r.vector.map(|v| (r.concept.id, v)))
            .collect();
        self.index.rebuild_from(entries).map_err(TelosError::from)
    }

    /// Combined tier counters
    pub fn stats(&self) -> KernelResult<FabricStats> {
        let l3 = self.store.stats().map_err(TelosError::from)?;
        Ok(FabricStats {
            l1: self.cache.snapshot_stats(),
            l2: self.index.stats(),
            l3_concepts: l3.concepts,
            l3_sequence: l3.last_sequence,
            outbox_pending: l3.outbox_pending,
            outbox_dead: l3.outbox_dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telos_ann::AnnParams;
    use telos_config::TelosConfig;

    fn fabric() -> (tempfile::TempDir, FederatedMemory) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConceptStore::open(dir.path().join("l3")).unwrap();
        let index = AnnIndex::open(dir.path().join("l2"), AnnParams::default()).unwrap();
        let cache = VectorCache::new(1 << 20);
        let mut config = TelosConfig::default();
        config.outbox_backoff_base_ms = 0;
        let coordinator =
            CoherenceCoordinator::new(&config, store.clone(), index.clone(), cache.clone());
        (
            dir,
            FederatedMemory::new(store, index, cache, coordinator),
        )
    }

    #[tokio::test]
    async fn read_through_falls_back_to_l3() {
        let (_dir, fabric) = fabric();
        let id = fabric.store().allocate_id().unwrap();
        fabric
            .write_concept(Concept::labeled(id, "deep"), Some(vec![0.2, 0.8]))
            .await
            .unwrap();

        // Nothing propagated yet: L1 and L2 are cold, L3 serves the read.
        let vector = fabric.read_vector(id).unwrap().unwrap();
        assert_eq!(vector.as_ref(), &vec![0.2, 0.8]);
    }

    #[tokio::test]
    async fn hot_concepts_are_promoted_into_l1() {
        let (_dir, fabric) = fabric();
        let id = fabric.store().allocate_id().unwrap();
        let mut concept = Concept::new(id);
        for _ in 0..5 {
            concept.record_usage();
        }
        fabric
            .write_concept(concept, Some(vec![1.0, 0.0]))
            .await
            .unwrap();

        assert_eq!(fabric.cache().snapshot_stats().entries, 0);
        fabric.read_vector(id).unwrap().unwrap();
        assert_eq!(fabric.cache().snapshot_stats().entries, 1);
        // The next read is an L1 hit.
        fabric.read_vector(id).unwrap().unwrap();
        assert_eq!(fabric.cache().snapshot_stats().hits, 1);
    }

    #[tokio::test]
    async fn search_reaches_l2_after_coherence() {
        let (_dir, fabric) = fabric();
        let id = fabric.store().allocate_id().unwrap();
        fabric
            .write_concept(Concept::new(id), Some(vec![0.9, 0.1]))
            .await
            .unwrap();
        fabric.coordinator().tick_once().unwrap();

        let results = fabric.search(&[0.9, 0.1], 1, None).unwrap();
        assert_eq!(results[0].0, id);
        assert!(results[0].1 > 0.99);
    }

    #[tokio::test]
    async fn rebuild_restores_l2_from_l3() {
        let (_dir, fabric) = fabric();
        let a = fabric.store().allocate_id().unwrap();
        let b = fabric.store().allocate_id().unwrap();
        fabric
            .write_concept(Concept::new(a), Some(vec![1.0, 0.0]))
            .await
            .unwrap();
        fabric
            .write_concept(Concept::new(b), Some(vec![0.0, 1.0]))
            .await
            .unwrap();

        let rebuilt = fabric.rebuild_index().unwrap();
        assert_eq!(rebuilt, 2);
        assert_eq!(fabric.search(&[0.0, 1.0], 1, None).unwrap()[0].0, b);
    }

    #[tokio::test]
    async fn record_usage_bumps_the_stored_counter() {
        let (_dir, fabric) = fabric();
        let id = fabric.store().allocate_id().unwrap();
        fabric.write_concept(Concept::new(id), None).await.unwrap();
        fabric.record_usage(id).await.unwrap();
        fabric.record_usage(id).await.unwrap();
        assert_eq!(fabric.concept(id).unwrap().unwrap().usage_count, 2);
    }
}
