//! Built-in operators
//!
//! The default operator complement: recall/associate/ground/compose for the
//! work kinds, one resolver per subgoal kind, and the adaptation applier
//! the free-energy controller targets. Numeric work goes through the
//! synaptic bridge; everything else runs inline on the cognitive thread.

use crate::frame::ProblemState;
use crate::goal::{Goal, GoalKind};
use crate::operator::{
    Operator, OperatorContext, OperatorEstimate, OperatorOutcome, OperatorRegistry,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use telos_kernel::{Concept, RelationKind, Result as KernelResult, TelosError};
use tracing::debug;

/// Default embedding width when a goal does not name one
const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Register the built-in operator complement
pub fn register_builtins(registry: &OperatorRegistry) {
    registry.register(Arc::new(RecallOperator));
    registry.register(Arc::new(AssociateOperator));
    registry.register(Arc::new(GroundOperator));
    registry.register(Arc::new(ComposeOperator));
    registry.register(Arc::new(ExplorationOperator));
    registry.register(Arc::new(DisambiguationOperator));
    registry.register(Arc::new(DiscoveryFallbackOperator));
    registry.register(Arc::new(RepairOperator));
    registry.register(Arc::new(AdaptationOperator));
}

/// Refreshes vectors and relations for the goal's concepts
pub struct RecallOperator;

#[async_trait]
impl Operator for RecallOperator {
    fn name(&self) -> &str {
        "recall"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Recall && !goal.concepts.is_empty()
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.8,
            cost: 0.1,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let mut found = 0usize;
        for id in &goal.concepts {
            if let Some(concept) = ctx.fabric.concept(*id)? {
                state.concepts.insert(*id, concept);
            }
            if let Some(vector) = ctx.fabric.read_vector(*id)? {
                state.vectors.insert(*id, vector.as_ref().clone());
                found += 1;
            }
        }
        let confidence = found as f64 / goal.concepts.len() as f64;
        Ok(OperatorOutcome {
            confidence,
            payload: json!({ "recalled": found, "requested": goal.concepts.len() }),
        })
    }
}

/// Finds nearest neighbors of the goal's first concept
pub struct AssociateOperator;

#[async_trait]
impl Operator for AssociateOperator {
    fn name(&self) -> &str {
        "associate"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Associate && !goal.concepts.is_empty()
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.7,
            cost: 0.15,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let cue = goal.concepts[0];
        let vector = match state.vectors.get(&cue) {
            Some(v) => v.clone(),
            None => match ctx.fabric.read_vector(cue)? {
                Some(v) => v.as_ref().clone(),
                None => {
                    return Ok(OperatorOutcome {
                        confidence: 0.0,
                        payload: json!({ "reason": "cue has no vector" }),
                    })
                }
            },
        };

        let neighbors = ctx.fabric.search(&vector, 5, None)?;
        let top_score = neighbors
            .iter()
            .find(|(id, _)| *id != cue)
            .map(|(_, score)| *score as f64)
            .unwrap_or(0.0);
        state.features.insert(
            "associations".to_string(),
            json!(neighbors
                .iter()
                .map(|(id, score)| json!([id.as_u64(), score]))
                .collect::<Vec<_>>()),
        );
        Ok(OperatorOutcome {
            confidence: top_score.clamp(0.0, 1.0),
            payload: json!({ "neighbors": neighbors.len() }),
        })
    }
}

/// Grounds the goal's `text` feature into a concept embedding via the bridge
pub struct GroundOperator;

#[async_trait]
impl Operator for GroundOperator {
    fn name(&self) -> &str {
        "ground"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Ground && goal.features.contains_key("text")
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.85,
            cost: 0.3,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let text = goal.features.get("text").cloned().unwrap_or_default();
        let dimensions = goal
            .features
            .get("dimensions")
            .and_then(|d| d.parse().ok())
            .unwrap_or(DEFAULT_EMBEDDING_DIM);

        let output = ctx.alloc_output(dimensions)?;
        let task = telos_bridge::Task::builder("embed_text")
            .config(json!({ "text": text }))
            .output(output.href().clone())
            .priority(goal.priority)
            .build();
        let dispatch = ctx.dispatch(task).await;
        let embedding = match dispatch {
            Ok(_) => ctx.read_handle(output.href()),
            Err(err) => {
                ctx.release(output.href());
                return Err(err);
            }
        };
        ctx.release(output.href());
        let embedding = embedding?;

        // Persist into the concept named by the goal, or mint a new one.
        let id = match goal.concepts.first() {
            Some(id) => *id,
            None => ctx.fabric.store().allocate_id().map_err(TelosError::from)?,
        };
        let mut concept = ctx
            .fabric
            .concept(id)?
            .unwrap_or_else(|| Concept::labeled(id, text.clone()));
        concept.set_confidence(0.9)?;
        ctx.fabric.write_concept(concept, Some(embedding)).await?;
        state.features.insert("grounded".to_string(), json!(id.as_u64()));

        Ok(OperatorOutcome {
            confidence: 0.9,
            payload: json!({ "concept": id.as_u64(), "dimensions": dimensions }),
        })
    }
}

/// Binds two concept vectors into a new composite concept via the bridge
pub struct ComposeOperator;

#[async_trait]
impl Operator for ComposeOperator {
    fn name(&self) -> &str {
        "compose"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Compose && goal.concepts.len() >= 2
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.75,
            cost: 0.35,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let (left_id, right_id) = (goal.concepts[0], goal.concepts[1]);
        let left = ctx
            .fabric
            .read_vector(left_id)?
            .ok_or_else(|| TelosError::not_found(left_id.to_string()))?;
        let right = ctx
            .fabric
            .read_vector(right_id)?
            .ok_or_else(|| TelosError::not_found(right_id.to_string()))?;
        if left.len() != right.len() {
            return Err(TelosError::invalid("operand dimensions differ"));
        }

        let a = ctx.alloc_vector(&left)?;
        let b = ctx.alloc_vector(&right)?;
        let out = ctx.alloc_output(left.len())?;
        let task = telos_bridge::Task::builder("vsa_bind")
            .input(a.href().clone())
            .input(b.href().clone())
            .output(out.href().clone())
            .priority(goal.priority)
            .build();

        let dispatched = ctx.dispatch(task).await;
        let bound = match dispatched {
            Ok(_) => ctx.read_handle(out.href()),
            Err(err) => {
                for href in [a.href(), b.href(), out.href()] {
                    ctx.release(href);
                }
                return Err(err);
            }
        };
        for href in [a.href(), b.href(), out.href()] {
            ctx.release(href);
        }
        let bound = bound?;

        let composite_id = ctx.fabric.store().allocate_id().map_err(TelosError::from)?;
        let mut composite = Concept::labeled(composite_id, format!("{left_id}*{right_id}"));
        composite.relate(RelationKind::AssociatedWith, left_id)?;
        composite.relate(RelationKind::AssociatedWith, right_id)?;
        composite.set_confidence(0.9)?;
        ctx.fabric.write_concept(composite, Some(bound)).await?;
        state
            .features
            .insert("composed".to_string(), json!(composite_id.as_u64()));

        Ok(OperatorOutcome {
            confidence: 0.9,
            payload: json!({ "composed": composite_id.as_u64() }),
        })
    }
}

/// Resolves `state-no-change` impasses by widening the problem state
pub struct ExplorationOperator;

#[async_trait]
impl Operator for ExplorationOperator {
    fn name(&self) -> &str {
        "exploration.broaden"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Exploration
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.9,
            cost: 0.05,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        // Pull neighbors of every known concept into the state so the
        // parent frame sees a wider field.
        let mut widened = 0usize;
        for id in &goal.concepts {
            if let Some(vector) = ctx.fabric.read_vector(*id)? {
                for (neighbor, _) in ctx.fabric.search(&vector, 3, None)? {
                    if let Some(concept) = ctx.fabric.concept(neighbor)? {
                        state.concepts.entry(neighbor).or_insert(concept);
                        widened += 1;
                    }
                }
            }
        }
        state.features.insert("explored".to_string(), json!(true));
        Ok(OperatorOutcome {
            confidence: 0.92,
            payload: json!({ "widened": widened }),
        })
    }
}

/// Resolves `operator-tie` impasses by preferring the first tied operator
pub struct DisambiguationOperator;

#[async_trait]
impl Operator for DisambiguationOperator {
    fn name(&self) -> &str {
        "disambiguation.prefer-first"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Disambiguation && goal.features.contains_key("tied")
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.9,
            cost: 0.02,
        }
    }

    async fn apply(
        &self,
        _ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let tied = goal.features.get("tied").cloned().unwrap_or_default();
        let preferred = tied.split(',').next().unwrap_or("").to_string();
        if preferred.is_empty() {
            return Ok(OperatorOutcome::with_confidence(0.0));
        }
        state
            .features
            .insert("preferred_operator".to_string(), json!(preferred));
        Ok(OperatorOutcome {
            confidence: 0.92,
            payload: json!({ "preferred": state.features["preferred_operator"] }),
        })
    }
}

/// Resolves `operator-no-change` impasses by minting a concept from the
/// goal's features - the statically typed rendition of capability synthesis
pub struct DiscoveryFallbackOperator;

#[async_trait]
impl Operator for DiscoveryFallbackOperator {
    fn name(&self) -> &str {
        "discovery.fallback"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Discovery
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.9,
            cost: 0.1,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let id = ctx.fabric.store().allocate_id().map_err(TelosError::from)?;
        let mut concept = Concept::labeled(id, goal.description.clone());
        for (key, value) in &goal.features {
            concept
                .metadata
                .insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        concept.set_confidence(0.95)?;
        ctx.fabric.write_concept(concept, None).await?;
        state
            .features
            .insert("discovered".to_string(), json!(id.as_u64()));
        debug!(%id, "discovery fallback minted concept");
        Ok(OperatorOutcome {
            confidence: 0.95,
            payload: json!({ "concept": id.as_u64() }),
        })
    }
}

/// Resolves `operator-failure` impasses by clearing the failure context
pub struct RepairOperator;

#[async_trait]
impl Operator for RepairOperator {
    fn name(&self) -> &str {
        "repair.reset"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Repair
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.85,
            cost: 0.05,
        }
    }

    async fn apply(
        &self,
        _ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        state.features.insert("repaired".to_string(), json!(true));
        if let Some(failed) = goal.features.get("failed_operator") {
            state
                .features
                .insert("avoid_operator".to_string(), json!(failed));
        }
        Ok(OperatorOutcome {
            confidence: 0.92,
            payload: json!({ "repaired": true }),
        })
    }
}

/// Applies an adaptation strategy injected by the free-energy controller
pub struct AdaptationOperator;

#[async_trait]
impl Operator for AdaptationOperator {
    fn name(&self) -> &str {
        "adaptation.apply-strategy"
    }

    fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
        goal.kind == GoalKind::Adaptation && goal.strategy.is_some()
    }

    fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
        OperatorEstimate {
            success_probability: 0.95,
            cost: 0.05,
        }
    }

    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome> {
        let strategy = goal.strategy.clone().unwrap_or_default();

        // Record the adaptation as knowledge: what was applied, and to what
        // system state. The concept doubles as the adaptation audit log.
        let id = ctx.fabric.store().allocate_id().map_err(TelosError::from)?;
        let mut record = Concept::labeled(id, format!("adaptation:{strategy}"));
        record.metadata.insert(
            "strategy".to_string(),
            serde_json::Value::String(strategy.clone()),
        );
        record.metadata.insert(
            "fabric_stats".to_string(),
            serde_json::to_value(ctx.fabric.stats()?)
                .unwrap_or(serde_json::Value::Null),
        );
        record.set_confidence(1.0)?;
        ctx.fabric.write_concept(record, None).await?;

        if strategy == "memory-management" {
            // Relieve pressure at the cheapest tier first.
            ctx.fabric.index().save().map_err(TelosError::from)?;
        }

        state
            .features
            .insert("applied_strategy".to_string(), json!(strategy));
        Ok(OperatorOutcome {
            confidence: 1.0,
            payload: json!({ "strategy": goal.strategy }),
        })
    }
}
