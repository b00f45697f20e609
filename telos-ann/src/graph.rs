//! Graph structure and beam-search internals
//!
//! A flat proximity graph in the Vamana family: greedy best-first beam
//! search for querying, alpha-slack neighbor pruning for construction.
//! All mutation happens under the index's write lock, so the structures
//! here are single-threaded.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use telos_kernel::ConceptId;

/// Cosine similarity of two equal-length vectors; 0.0 when either norm is 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// (score, id) with total order: higher score first, then lower id
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scored {
    pub score: f32,
    pub id: ConceptId,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Node {
    pub vector: Vec<f32>,
    pub neighbors: Vec<ConceptId>,
}

/// The serialized graph state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Graph {
    pub nodes: BTreeMap<ConceptId, Node>,
    pub entry: Option<ConceptId>,
    pub dimensions: Option<usize>,
}

impl Graph {
    /// Best-first beam search from the entry point. Returns up to
    /// `beam_width` candidates sorted best-first.
    pub fn beam_search(&self, query: &[f32], beam_width: usize) -> Vec<Scored> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let beam_width = beam_width.max(1);

        let mut visited: BTreeSet<ConceptId> = BTreeSet::new();
        let mut frontier: BinaryHeap<Scored> = BinaryHeap::new();
        // Min-heap of the current best set, worst on top.
        let mut best: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

        let entry_score = Scored {
            score: cosine_similarity(query, &self.nodes[&entry].vector),
            id: entry,
        };
        visited.insert(entry);
        frontier.push(entry_score);
        best.push(std::cmp::Reverse(entry_score));

        while let Some(candidate) = frontier.pop() {
            if best.len() >= beam_width {
                let worst = best.peek().map(|r| r.0).unwrap_or(candidate);
                if candidate < worst {
                    break;
                }
            }
            let Some(node) = self.nodes.get(&candidate.id) else {
                continue;
            };
            for neighbor in &node.neighbors {
                if !visited.insert(*neighbor) {
                    continue;
                }
                let Some(neighbor_node) = self.nodes.get(neighbor) else {
                    continue;
                };
                let scored = Scored {
                    score: cosine_similarity(query, &neighbor_node.vector),
                    id: *neighbor,
                };
                let admit = best.len() < beam_width
                    || best.peek().map(|r| scored > r.0).unwrap_or(true);
                if admit {
                    frontier.push(scored);
                    best.push(std::cmp::Reverse(scored));
                    if best.len() > beam_width {
                        best.pop();
                    }
                }
            }
        }

        let mut results: Vec<Scored> = best.into_iter().map(|r| r.0).collect();
        results.sort_by(|a, b| b.cmp(a));
        results
    }

    /// Alpha-slack neighbor selection: admit candidates in best-first order
    /// unless an already-admitted neighbor dominates them within the slack.
    pub fn select_neighbors(
        &self,
        anchor: &[f32],
        candidates: &[Scored],
        degree: usize,
        alpha: f64,
    ) -> Vec<ConceptId> {
        let mut selected: Vec<ConceptId> = Vec::with_capacity(degree);
        for candidate in candidates {
            if selected.len() >= degree {
                break;
            }
            let Some(candidate_node) = self.nodes.get(&candidate.id) else {
                continue;
            };
            let to_anchor = cosine_distance(anchor, &candidate_node.vector);
            let dominated = selected.iter().any(|chosen| {
                let chosen_node = &self.nodes[chosen];
                (cosine_distance(&candidate_node.vector, &chosen_node.vector) * alpha as f32)
                    < to_anchor
            });
            if !dominated {
                selected.push(candidate.id);
            }
        }
        selected
    }

    /// Insert a node and wire it bidirectionally, pruning over-degree
    /// neighbor lists with the same alpha rule.
    pub fn link(&mut self, id: ConceptId, vector: Vec<f32>, degree: usize, beam: usize, alpha: f64) {
        if self.nodes.is_empty() {
            self.nodes.insert(
                id,
                Node {
                    vector,
                    neighbors: Vec::new(),
                },
            );
            self.entry = Some(id);
            return;
        }

        let candidates = self.beam_search(&vector, beam.max(degree));
        let neighbors = self.select_neighbors(&vector, &candidates, degree, alpha);
        self.nodes.insert(
            id,
            Node {
                vector,
                neighbors: neighbors.clone(),
            },
        );

        for neighbor in neighbors {
            let anchor = self.nodes[&neighbor].vector.clone();
            let list = {
                let node = self.nodes.get_mut(&neighbor).expect("linked neighbor");
                if !node.neighbors.contains(&id) {
                    node.neighbors.push(id);
                }
                node.neighbors.clone()
            };
            if list.len() > degree {
                let mut scored: Vec<Scored> = list
                    .iter()
                    .filter_map(|n| {
                        self.nodes.get(n).map(|node| Scored {
                            score: cosine_similarity(&anchor, &node.vector),
                            id: *n,
                        })
                    })
                    .collect();
                scored.sort_by(|a, b| b.cmp(a));
                let pruned = self.select_neighbors(&anchor, &scored, degree, alpha);
                self.nodes.get_mut(&neighbor).expect("linked neighbor").neighbors = pruned;
            }
        }
    }

    /// Remove a node and every edge pointing at it
    pub fn unlink(&mut self, id: ConceptId) -> bool {
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        for node in self.nodes.values_mut() {
            node.neighbors.retain(|n| *n != id);
        }
        if self.entry == Some(id) {
            self.entry = self.nodes.keys().next().copied();
        }
        if self.nodes.is_empty() {
            self.dimensions = None;
        }
        true
    }
}
