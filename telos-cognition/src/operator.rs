//! Operators: named values with typed inputs
//!
//! The operator registry replaces the prototype world's dynamic dispatch.
//! Operators declare applicability against the current goal and state,
//! estimate their success probability and cost, and apply either inline or
//! by packaging a task for the synaptic bridge (the cycle suspends on the
//! returned future).

use crate::frame::ProblemState;
use crate::goal::Goal;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use telos_bridge::{SynapticBridge, Task, TaskResult};
use telos_federation::FederatedMemory;
use telos_kernel::{Dtype, HandleRef, Result as KernelResult, TelosError};
use telos_shm::{HandleTable, OwnerToken, SharedHandle};

/// Utility estimate for one operator against one goal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatorEstimate {
    /// Learned success probability P, in [0, 1]
    pub success_probability: f64,
    /// Estimated cost C, in goal-utility units
    pub cost: f64,
}

impl OperatorEstimate {
    /// U = P·G − C for a goal of utility G (recency bonus added by the engine)
    pub fn utility(&self, goal_utility: f64) -> f64 {
        self.success_probability * goal_utility - self.cost
    }
}

/// What applying an operator produced
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorOutcome {
    /// Confidence in the result, in [0, 1]; values below `theta_disc`
    /// count as "no confident result"
    pub confidence: f64,
    /// Operation-specific payload merged into the goal result
    pub payload: Value,
}

impl OperatorOutcome {
    /// An outcome with the given confidence and no payload
    pub fn with_confidence(confidence: f64) -> Self {
        Self {
            confidence,
            payload: Value::Null,
        }
    }
}

/// Shared services an operator may use while applying
#[derive(Clone)]
pub struct OperatorContext {
    /// The synaptic bridge for numeric work
    pub bridge: Arc<SynapticBridge>,
    /// The federated memory fabric
    pub fabric: FederatedMemory,
    /// Handle table for task payloads
    pub table: HandleTable,
    /// Owner token the cycle allocates under
    pub owner: OwnerToken,
    /// The registry, so compiled chunks can resolve their sequence
    pub registry: Arc<OperatorRegistry>,
}

impl OperatorContext {
    /// Allocate a segment holding `data`
    pub fn alloc_vector(&self, data: &[f32]) -> KernelResult<SharedHandle> {
        let handle = self
            .table
            .allocate(data.len(), Dtype::F32, self.owner)
            .map_err(TelosError::from)?;
        self.table
            .map(handle.href())
            .map_err(TelosError::from)?
            .write_f32(data)
            .map_err(TelosError::from)?;
        Ok(handle)
    }

    /// Allocate a zeroed f32 segment of `element_count`
    pub fn alloc_output(&self, element_count: usize) -> KernelResult<SharedHandle> {
        self.table
            .allocate(element_count, Dtype::F32, self.owner)
            .map_err(TelosError::from)
    }

    /// Read an f32 segment back out
    pub fn read_handle(&self, href: &HandleRef) -> KernelResult<Vec<f32>> {
        self.table
            .map(href)
            .map_err(TelosError::from)?
            .read_f32()
            .map_err(TelosError::from)
    }

    /// Release a handle allocated by this cycle
    pub fn release(&self, href: &HandleRef) {
        let _ = self.table.release(href);
    }

    /// Submit a task and suspend until its single completion
    pub async fn dispatch(&self, task: Task) -> KernelResult<TaskResult> {
        self.bridge
            .submit_task(task)
            .wait()
            .await
            .map_err(TelosError::from)
    }
}

/// A named operator over the problem space
#[async_trait]
pub trait Operator: Send + Sync {
    /// Registry name; unique
    fn name(&self) -> &str;

    /// Whether this operator applies to the goal in the given state
    fn applicable(&self, goal: &Goal, state: &ProblemState) -> bool;

    /// Success-probability and cost estimate
    fn estimate(&self, goal: &Goal, state: &ProblemState) -> OperatorEstimate;

    /// Apply the operator. May suspend on bridge futures; state mutation
    /// is single-threaded by construction.
    async fn apply(
        &self,
        ctx: &OperatorContext,
        goal: &Goal,
        state: &mut ProblemState,
    ) -> KernelResult<OperatorOutcome>;
}

/// The closed-but-extensible registry of operators.
///
/// Seeded at engine construction; chunk compilation and capability
/// synthesis append to it at runtime.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: RwLock<Vec<Arc<dyn Operator>>>,
}

impl OperatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operator; a later registration shadows an earlier one
    /// with the same name in `get`, but both remain proposable.
    pub fn register(&self, operator: Arc<dyn Operator>) {
        self.operators.write().push(operator);
    }

    /// Resolve an operator by name (latest registration wins)
    pub fn get(&self, name: &str) -> Option<Arc<dyn Operator>> {
        self.operators
            .read()
            .iter()
            .rev()
            .find(|op| op.name() == name)
            .cloned()
    }

    /// Operators applicable to the goal, in registration order
    pub fn propose(&self, goal: &Goal, state: &ProblemState) -> Vec<Arc<dyn Operator>> {
        self.operators
            .read()
            .iter()
            .filter(|op| op.applicable(goal, state))
            .cloned()
            .collect()
    }

    /// Registered operator count
    pub fn len(&self) -> usize {
        self.operators.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.operators
            .read()
            .iter()
            .map(|op| op.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalKind;

    struct Probe(&'static str, GoalKind);

    #[async_trait]
    impl Operator for Probe {
        fn name(&self) -> &str {
            self.0
        }
        fn applicable(&self, goal: &Goal, _state: &ProblemState) -> bool {
            goal.kind == self.1
        }
        fn estimate(&self, _goal: &Goal, _state: &ProblemState) -> OperatorEstimate {
            OperatorEstimate {
                success_probability: 0.5,
                cost: 0.1,
            }
        }
        async fn apply(
            &self,
            _ctx: &OperatorContext,
            _goal: &Goal,
            _state: &mut ProblemState,
        ) -> KernelResult<OperatorOutcome> {
            Ok(OperatorOutcome::with_confidence(1.0))
        }
    }

    #[test]
    fn propose_filters_by_applicability() {
        let registry = OperatorRegistry::new();
        registry.register(Arc::new(Probe("recall", GoalKind::Recall)));
        registry.register(Arc::new(Probe("associate", GoalKind::Associate)));

        let goal = Goal::new(GoalKind::Recall, "r");
        let proposed = registry.propose(&goal, &ProblemState::default());
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].name(), "recall");
    }

    #[test]
    fn latest_registration_shadows_by_name() {
        let registry = OperatorRegistry::new();
        registry.register(Arc::new(Probe("recall", GoalKind::Recall)));
        registry.register(Arc::new(Probe("recall", GoalKind::Associate)));
        let got = registry.get("recall").unwrap();
        assert!(got.applicable(&Goal::new(GoalKind::Associate, "a"), &ProblemState::default()));
    }

    #[test]
    fn utility_formula() {
        let estimate = OperatorEstimate {
            success_probability: 0.8,
            cost: 0.3,
        };
        assert!((estimate.utility(2.0) - 1.3).abs() < 1e-12);
    }
}
