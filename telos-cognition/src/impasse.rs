//! Impasse classification

use crate::goal::GoalKind;
use serde::{Deserialize, Serialize};

/// A decision-phase outcome that forces a subgoal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Impasse {
    /// No operator produced a confident result
    StateNoChange,
    /// Two or more operators tied on utility
    OperatorTie {
        /// The tied operator names
        operators: Vec<String>,
    },
    /// Propose produced no applicable operator
    OperatorNoChange,
    /// The applied operator returned an error
    OperatorFailure {
        /// Operator that failed
        operator: String,
        /// Error kind string from the closed taxonomy
        error: String,
    },
}

impl Impasse {
    /// The subgoal kind an impasse of this type creates
    pub fn subgoal_kind(&self) -> GoalKind {
        match self {
            Impasse::StateNoChange => GoalKind::Exploration,
            Impasse::OperatorTie { .. } => GoalKind::Disambiguation,
            Impasse::OperatorNoChange => GoalKind::Discovery,
            Impasse::OperatorFailure { .. } => GoalKind::Repair,
        }
    }

    /// Stable name for telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            Impasse::StateNoChange => "state-no-change",
            Impasse::OperatorTie { .. } => "operator-tie",
            Impasse::OperatorNoChange => "operator-no-change",
            Impasse::OperatorFailure { .. } => "operator-failure",
        }
    }
}
