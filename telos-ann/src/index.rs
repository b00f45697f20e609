//! Public index API and snapshot persistence

use crate::graph::{Graph, Scored};
use crate::{AnnError, AnnResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telos_kernel::ConceptId;
use tracing::{debug, info, instrument};

const SNAPSHOT_FILE: &str = "index.snapshot";
const META_FILE: &str = "index.meta";

/// Build and maintenance parameters; tuned per workload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnParams {
    /// Maximum neighbors per node
    pub graph_degree: usize,
    /// Beam width for search and construction
    pub beam_width: usize,
    /// Pruning slack factor, >= 1.0
    pub alpha: f64,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            graph_degree: 16,
            beam_width: 64,
            alpha: 1.2,
        }
    }
}

/// Index counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AnnStats {
    /// Nodes in the graph
    pub nodes: usize,
    /// Searches served
    pub searches: u64,
    /// Mutations applied (insert/update/delete)
    pub mutations: u64,
}

/// Single-writer, many-reader ANN index.
///
/// Cheap to clone; clones share the same graph.
#[derive(Clone)]
pub struct AnnIndex {
    inner: Arc<IndexInner>,
}

struct IndexInner {
    graph: RwLock<Graph>,
    params: AnnParams,
    dir: PathBuf,
    searches: AtomicU64,
    mutations: AtomicU64,
}

impl AnnIndex {
    /// Open the index under `dir`, loading the snapshot file set if present
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>, params: AnnParams) -> AnnResult<Self> {
        if params.graph_degree < 2 {
            return Err(AnnError::Invalid("graph degree must be >= 2".to_string()));
        }
        if params.alpha < 1.0 {
            return Err(AnnError::Invalid("alpha must be >= 1.0".to_string()));
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let graph = if snapshot_path.exists() {
            let bytes = std::fs::read(&snapshot_path)?;
            let graph: Graph = bincode::deserialize(&bytes)
                .map_err(|e| AnnError::Persistence(format!("snapshot codec: {e}")))?;
            info!(nodes = graph.nodes.len(), "ann snapshot loaded");
            graph
        } else {
            Graph::default()
        };

        Ok(Self {
            inner: Arc::new(IndexInner {
                graph: RwLock::new(graph),
                params,
                dir,
                searches: AtomicU64::new(0),
                mutations: AtomicU64::new(0),
            }),
        })
    }

    fn check_dimensions(graph: &Graph, vector: &[f32]) -> AnnResult<()> {
        if vector.is_empty() {
            return Err(AnnError::Invalid("empty vector".to_string()));
        }
        if let Some(dimensions) = graph.dimensions {
            if vector.len() != dimensions {
                return Err(AnnError::Invalid(format!(
                    "vector of {} dimensions in an index of {}",
                    vector.len(),
                    dimensions
                )));
            }
        }
        Ok(())
    }

    /// Insert a vector under an id; replaces silently if the id exists
    pub fn insert(&self, id: ConceptId, vector: Vec<f32>) -> AnnResult<()> {
        let mut graph = self.inner.graph.write();
        Self::check_dimensions(&graph, &vector)?;
        if graph.nodes.contains_key(&id) {
            graph.unlink(id);
        }
        graph.dimensions.get_or_insert(vector.len());
        graph.link(
            id,
            vector,
            self.inner.params.graph_degree,
            self.inner.params.beam_width,
            self.inner.params.alpha,
        );
        self.inner.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the vector under an id
    pub fn update(&self, id: ConceptId, vector: Vec<f32>) -> AnnResult<()> {
        self.insert(id, vector)
    }

    /// Remove an id; returns whether it was present
    pub fn remove(&self, id: ConceptId) -> AnnResult<bool> {
        let removed = self.inner.graph.write().unlink(id);
        if removed {
            self.inner.mutations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// k-nearest search.
    ///
    /// Results are ordered by descending similarity then ascending id;
    /// entries scoring below `threshold` are filtered out.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: Option<f32>,
    ) -> AnnResult<Vec<(ConceptId, f32)>> {
        let graph = self.inner.graph.read();
        Self::check_dimensions(&graph, query)?;
        self.inner.searches.fetch_add(1, Ordering::Relaxed);

        let beam = self.inner.params.beam_width.max(k);
        let mut candidates: Vec<Scored> = graph.beam_search(query, beam);
        if let Some(threshold) = threshold {
            candidates.retain(|c| c.score >= threshold);
        }
        candidates.truncate(k);
        Ok(candidates.into_iter().map(|c| (c.id, c.score)).collect())
    }

    /// Whether an id is indexed
    pub fn contains(&self, id: ConceptId) -> bool {
        self.inner.graph.read().nodes.contains_key(&id)
    }

    /// The stored vector for an id, if indexed
    pub fn vector_of(&self, id: ConceptId) -> Option<Vec<f32>> {
        self.inner
            .graph
            .read()
            .nodes
            .get(&id)
            .map(|node| node.vector.clone())
    }

    /// Nodes currently indexed
    pub fn len(&self) -> usize {
        self.inner.graph.read().nodes.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the snapshot file set atomically (write-new then rename)
    #[instrument(skip_all)]
    pub fn save(&self) -> AnnResult<()> {
        let graph = self.inner.graph.read();
        let bytes = bincode::serialize(&*graph)
            .map_err(|e| AnnError::Persistence(format!("snapshot codec: {e}")))?;
        let meta = serde_json::to_vec(&self.inner.params)
            .map_err(|e| AnnError::Persistence(format!("meta codec: {e}")))?;
        drop(graph);

        let snapshot_tmp = self.inner.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        std::fs::write(&snapshot_tmp, bytes)?;
        std::fs::rename(&snapshot_tmp, self.inner.dir.join(SNAPSHOT_FILE))?;

        let meta_tmp = self.inner.dir.join(format!("{META_FILE}.tmp"));
        std::fs::write(&meta_tmp, meta)?;
        std::fs::rename(&meta_tmp, self.inner.dir.join(META_FILE))?;

        debug!("ann snapshot persisted");
        Ok(())
    }

    /// Drop the graph and rebuild it from `entries` (an L3 scan).
    /// Returns the number of vectors indexed.
    #[instrument(skip_all)]
    pub fn rebuild_from(
        &self,
        entries: impl IntoIterator<Item = (ConceptId, Vec<f32>)>,
    ) -> AnnResult<usize> {
        let mut graph = self.inner.graph.write();
        *graph = Graph::default();
        let mut indexed = 0;
        for (id, vector) in entries {
            Self::check_dimensions(&graph, &vector)?;
            graph.dimensions.get_or_insert(vector.len());
            graph.link(
                id,
                vector,
                self.inner.params.graph_degree,
                self.inner.params.beam_width,
                self.inner.params.alpha,
            );
            indexed += 1;
        }
        info!(indexed, "ann index rebuilt");
        Ok(indexed)
    }

    /// Counters snapshot
    pub fn stats(&self) -> AnnStats {
        AnnStats {
            nodes: self.len(),
            searches: self.inner.searches.load(Ordering::Relaxed),
            mutations: self.inner.mutations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    fn open_index() -> (tempfile::TempDir, AnnIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = AnnIndex::open(dir.path(), AnnParams::default()).unwrap();
        (dir, index)
    }

    #[test]
    fn nearest_neighbor_is_found() {
        let (_dir, index) = open_index();
        for (i, angle) in [0.0f32, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0].iter().enumerate() {
            index.insert(ConceptId(i as u64), unit(*angle)).unwrap();
        }
        let results = index.search(&unit(0.55), 3, None).unwrap();
        assert_eq!(results[0].0, ConceptId(1));
        assert!(results[0].1 > results[1].1 || results[0].0 < results[1].0);
    }

    #[test]
    fn threshold_filters_low_scores() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(1), vec![1.0, 0.0]).unwrap();
        index.insert(ConceptId(2), vec![0.0, 1.0]).unwrap();

        let all = index.search(&[1.0, 0.0], 10, None).unwrap();
        assert_eq!(all.len(), 2);
        let filtered = index.search(&[1.0, 0.0], 10, Some(0.9)).unwrap();
        assert_eq!(filtered, vec![(ConceptId(1), 1.0)]);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(9), vec![1.0, 0.0]).unwrap();
        index.insert(ConceptId(3), vec![1.0, 0.0]).unwrap();
        index.insert(ConceptId(6), vec![1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 3, None).unwrap();
        let ids: Vec<u64> = results.iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(ids, vec![3, 6, 9]);
    }

    #[test]
    fn update_moves_a_vector() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(1), vec![1.0, 0.0]).unwrap();
        index.insert(ConceptId(2), vec![0.7, 0.7]).unwrap();
        index.update(ConceptId(1), vec![0.0, 1.0]).unwrap();

        let results = index.search(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(results[0].0, ConceptId(1));
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(1), vec![1.0, 0.0]).unwrap();
        assert!(index.remove(ConceptId(1)).unwrap());
        assert!(!index.remove(ConceptId(1)).unwrap());
        assert!(index.search(&[1.0, 0.0], 1, None).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(1), vec![1.0, 0.0]).unwrap();
        assert!(index.insert(ConceptId(2), vec![1.0, 0.0, 0.0]).is_err());
        assert!(index.search(&[1.0], 1, None).is_err());
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = AnnIndex::open(dir.path(), AnnParams::default()).unwrap();
            for i in 0..10u64 {
                index.insert(ConceptId(i), unit(i as f32 * 0.3)).unwrap();
            }
            index.save().unwrap();
        }
        let reopened = AnnIndex::open(dir.path(), AnnParams::default()).unwrap();
        assert_eq!(reopened.len(), 10);
        let results = reopened.search(&unit(0.9), 1, None).unwrap();
        assert_eq!(results[0].0, ConceptId(3));
    }

    #[test]
    fn rebuild_replaces_the_graph() {
        let (_dir, index) = open_index();
        index.insert(ConceptId(1), vec![1.0, 0.0]).unwrap();
        let rebuilt = index
            .rebuild_from(vec![
                (ConceptId(10), vec![0.0, 1.0]),
                (ConceptId(11), vec![0.1, 0.9]),
            ])
            .unwrap();
        assert_eq!(rebuilt, 2);
        assert!(!index.contains(ConceptId(1)));
        assert_eq!(index.search(&[0.0, 1.0], 1, None).unwrap()[0].0, ConceptId(10));
    }

    #[test]
    fn recall_on_a_larger_set() {
        let (_dir, index) = open_index();
        let mut rng = fastrand::Rng::with_seed(7);
        let mut vectors = Vec::new();
        for i in 0..200u64 {
            let v: Vec<f32> = (0..8).map(|_| rng.f32() * 2.0 - 1.0).collect();
            index.insert(ConceptId(i), v.clone()).unwrap();
            vectors.push((ConceptId(i), v));
        }

        // The graph search should find the exact nearest neighbor for most
        // stored vectors queried verbatim.
        let mut found = 0;
        for (id, v) in vectors.iter().take(50) {
            let results = index.search(v, 1, None).unwrap();
            if results.first().map(|(rid, _)| rid) == Some(id) {
                found += 1;
            }
        }
        assert!(found >= 45, "recall too low: {found}/50");
    }
}
