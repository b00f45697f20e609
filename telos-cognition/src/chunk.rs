//! Procedural chunks: compiled condition → operator-sequence productions
//!
//! When a subgoal resolves successfully, the sequence of operators that
//! resolved it is compiled into a chunk and inserted into the operator
//! registry with initial strength 1.0. Chunks are append-only: they are
//! never mutated in place, only superseded.

use crate::frame::ProblemState;
use crate::goal::{Goal, GoalKind};
use crate::operator::{
    Operator, OperatorContext, OperatorEstimate, OperatorOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telos_kernel::{Result as KernelResult, TelosError};
use tracing::debug;
use uuid::Uuid;

/// Condition pattern over working-memory features
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCondition {
    /// Goal kind the chunk fires on
    pub goal_kind: GoalKind,
    /// Features that must all be present with equal values
    pub features: BTreeMap<String, String>,
}

impl ChunkCondition {
    /// Whether the pattern matches a goal in a state.
    ///
    /// Every condition feature must appear, with an equal value, either in
    /// the goal's features or in the state's string features.
    pub fn matches(&self, goal: &Goal, state: &ProblemState) -> bool {
        if goal.kind != self.goal_kind {
            return false;
        }
        let state_features = state.string_features();
        self.features.iter().all(|(key, value)| {
            goal.features.get(key) == Some(value) || state_features.get(key) == Some(value)
        })
    }
}

/// A compiled production
#[derive(Debug, Serialize, Deserialize)]
pub struct ProceduralChunk {
    /// Unique chunk identity
    pub id: Uuid,
    /// When the chunk fires
    pub condition: ChunkCondition,
    /// Operator names applied in order
    pub operators: Vec<String>,
    /// Strength in [0, 1]; seeds the success-probability estimate
    pub strength: f64,
    /// Times the chunk has fired
    #[serde(skip)]
    pub usage_count: AtomicU64,
    /// When the chunk was compiled
    pub compiled_at: DateTime<Utc>,
    /// Set when a newer chunk replaces this one
    pub superseded_by: Option<Uuid>,
}

impl ProceduralChunk {
    /// Compile a chunk with initial strength 1.0
    pub fn compile(condition: ChunkCondition, operators: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            condition,
            operators,
            strength: 1.0,
            usage_count: AtomicU64::new(0),
            compiled_at: Utc::now(),
            superseded_by: None,
        }
    }
}

/// Append-only chunk store
#[derive(Default)]
pub struct ChunkStore {
    chunks: RwLock<Vec<Arc<ProceduralChunk>>>,
}

impl ChunkStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    pub fn insert(&self, chunk: Arc<ProceduralChunk>) {
        debug!(chunk = %chunk.id, operators = ?chunk.operators, "chunk compiled");
        self.chunks.write().push(chunk);
    }

    /// All live (non-superseded) chunks
    pub fn live(&self) -> Vec<Arc<ProceduralChunk>> {
        self.chunks
            .read()
            .iter()
            .filter(|c| c.superseded_by.is_none())
            .cloned()
            .collect()
    }

    /// Total chunks ever compiled
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether no chunks exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Supersede `old` with a recompiled chunk; the retired chunk keeps its
    /// history and gains only the forward pointer.
    pub fn supersede(&self, old: Uuid, replacement: Arc<ProceduralChunk>) {
        let mut chunks = self.chunks.write();
        for slot in chunks.iter_mut() {
            if slot.id == old && slot.superseded_by.is_none() {
                let retired = ProceduralChunk {
                    id: slot.id,
                    condition: slot.condition.clone(),
                    operators: slot.operators.clone(),
                    strength: slot.strength,
                    usage_count: AtomicU64::new(slot.usage_count.load(Ordering::Relaxed)),
                    compiled_at: slot.compiled_at,
                    superseded_by: Some(replacement.id),
                };
                *slot = Arc::new(retired);
            }
        }
        chunks.push(replacement);
    }
}

/// Adapter exposing a chunk as an operator
pub struct ChunkOperator {
    chunk: Arc<ProceduralChunk>,
    name: String,
}

impl ChunkOperator {
    /// Wrap a chunk for registry insertion
    pub fn new(chunk: Arc<ProceduralChunk>) -> Self {
        let name = format!("chunk:{}", chunk.id.simple());
        Self { chunk, name }
    }

    /// The wrapped chunk
    pub fn chunk(&self) -> &Arc<ProceduralChunk> {
        &self.chunk
    }
}

#[async_trait]
impl Operator for ChunkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn applicable(&self, goal: &Goal, state: &ProblemState) -> bool {
        self.chunk.superseded_by.is_none() && self.chunk.condition.matches(goal, state)
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        // Compiled knowledge is cheap to re-run; strength stands in for P.
        OperatorEstimate {
            success_probability: self.chunk.strength,
            cost: 0.01,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        self.chunk.usage_count.fetch_add(1, Ordering::Relaxed);
        let mut last = OperatorOutcome::with_confidence(0.0);
        for name in &self.chunk.operators {
            let Some(operator) = ctx.registry.get(name) else {
                return Err(TelosError::not_found(format!(
                    "chunk references unknown operator {name}"
                )));
            };
            last = operator.apply(ctx, goal, state).await?;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(kind: GoalKind, pairs: &[(&str, &str)]) -> ChunkCondition {
        ChunkCondition {
            goal_kind: kind,
            features: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn condition_matches_goal_features() {
        let cond = condition(GoalKind::Discovery, &[("domain", "botany")]);
        let goal = Goal::new(GoalKind::Discovery, "g").with_feature("domain", "botany");
        assert!(cond.matches(&goal, &ProblemState::default()));

        let wrong_kind = Goal::new(GoalKind::Recall, "g").with_feature("domain", "botany");
        assert!(!cond.matches(&wrong_kind, &ProblemState::default()));

        let wrong_value = Goal::new(GoalKind::Discovery, "g").with_feature("domain", "physics");
        assert!(!cond.matches(&wrong_value, &ProblemState::default()));
    }

    #[test]
    fn condition_matches_state_features() {
        let cond = condition(GoalKind::Exploration, &[("phase", "warm")]);
        let goal = Goal::new(GoalKind::Exploration, "g");
        let mut state = ProblemState::default();
        assert!(!cond.matches(&goal, &state));
        state
            .features
            .insert("phase".to_string(), serde_json::json!("warm"));
        assert!(cond.matches(&goal, &state));
    }

    #[test]
    fn chunks_compile_with_full_strength() {
        let chunk = ProceduralChunk::compile(
            condition(GoalKind::Discovery, &[]),
            vec!["fallback".to_string()],
        );
        assert!((chunk.strength - 1.0).abs() < f64::EPSILON);
        assert!(chunk.superseded_by.is_none());
    }

    #[test]
    fn store_is_append_only() {
        let store = ChunkStore::new();
        let chunk = Arc::new(ProceduralChunk::compile(
            condition(GoalKind::Repair, &[]),
            vec!["retry".to_string()],
        ));
        store.insert(Arc::clone(&chunk));
        assert_eq!(store.len(), 1);
        assert_eq!(store.live().len(), 1);
    }

    #[test]
    fn superseded_chunks_leave_the_live_set() {
        let store = ChunkStore::new();
        let old = Arc::new(ProceduralChunk::compile(
            condition(GoalKind::Discovery, &[("domain", "void")]),
            vec!["discovery.fallback".to_string()],
        ));
        let old_id = old.id;
        store.insert(old);

        let replacement = Arc::new(ProceduralChunk::compile(
            condition(GoalKind::Discovery, &[("domain", "void")]),
            vec!["discovery.fallback".to_string(), "recall".to_string()],
        ));
        let replacement_id = replacement.id;
        store.supersede(old_id, replacement);

        assert_eq!(store.len(), 2);
        let live = store.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, replacement_id);

        // The retired chunk keeps its history plus the forward pointer.
        let goal = Goal::new(GoalKind::Discovery, "g").with_feature("domain", "void");
        let wrapped = ChunkOperator::new(
            store
                .chunks
                .read()
                .iter()
                .find(|c| c.id == old_id)
                .cloned()
                .unwrap(),
        );
        assert!(!wrapped.applicable(&goal, &ProblemState::default()));
    }
}
