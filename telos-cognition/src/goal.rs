//! Goals and goal results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use telos_bridge::Priority;
use telos_kernel::ConceptId;
use uuid::Uuid;

/// What a goal asks the engine to do.
///
/// The first group are work kinds carried by external requests; the second
/// group are subgoal kinds created by impasses; `Adaptation` goals are
/// injected by the free-energy controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalKind {
    /// Retrieve vectors and relations for named concepts
    Recall,
    /// Find concepts similar to a cue
    Associate,
    /// Ground a text into a concept embedding
    Ground,
    /// Compose concept vectors into a new structure
    Compose,
    /// Apply an adaptation strategy chosen by the controller
    Adaptation,
    /// Subgoal: broaden the state after `state-no-change`
    Exploration,
    /// Subgoal: break an `operator-tie`
    Disambiguation,
    /// Subgoal: synthesize a capability after `operator-no-change`
    Discovery,
    /// Subgoal: recover from an `operator-failure`
    Repair,
}

impl GoalKind {
    /// Whether this kind is created only as a subgoal
    pub fn is_subgoal(&self) -> bool {
        matches!(
            self,
            GoalKind::Exploration
                | GoalKind::Disambiguation
                | GoalKind::Discovery
                | GoalKind::Repair
        )
    }
}

/// A unit of intent processed by the cycle engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique goal identity
    pub id: Uuid,
    /// What to do
    pub kind: GoalKind,
    /// Human-readable intent
    pub description: String,
    /// Concepts the goal refers to; working memory refreshes these
    pub concepts: Vec<ConceptId>,
    /// Feature set used for operator applicability and chunk matching
    pub features: BTreeMap<String, String>,
    /// Goal utility G in U = P·G − C
    pub utility: f64,
    /// Dispatch class for tasks this goal spawns
    pub priority: Priority,
    /// Adaptation strategy name, for `Adaptation` goals
    pub strategy: Option<String>,
    /// The goal this one was subgoaled from
    pub parent: Option<Uuid>,
}

impl Goal {
    /// Create a goal of the given kind
    pub fn new(kind: GoalKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            description: description.into(),
            concepts: Vec::new(),
            features: BTreeMap::new(),
            utility: 1.0,
            priority: Priority::Interactive,
            strategy: None,
            parent: None,
        }
    }

    /// Attach referenced concepts
    pub fn with_concepts(mut self, concepts: Vec<ConceptId>) -> Self {
        self.concepts = concepts;
        self
    }

    /// Attach a feature
    pub fn with_feature(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.features.insert(key.into(), value.into());
        self
    }

    /// Set the goal utility
    pub fn with_utility(mut self, utility: f64) -> Self {
        self.utility = utility;
        self
    }

    /// Set the adaptation strategy
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Derive a subgoal of the given kind
    pub fn subgoal(&self, kind: GoalKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            description: description.into(),
            concepts: self.concepts.clone(),
            features: self.features.clone(),
            utility: self.utility,
            priority: self.priority,
            strategy: self.strategy.clone(),
            parent: Some(self.id),
        }
    }
}

/// Outcome of a resolved (or abandoned) goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalResult {
    /// Whether the goal resolved successfully
    pub success: bool,
    /// Best result confidence achieved
    pub confidence: f64,
    /// Operation-specific payload from the resolving operator
    pub payload: serde_json::Value,
}
