//! Working memory: the frame stack of an active cycle

use crate::goal::Goal;
use serde_json::Value;
use std::collections::BTreeMap;
use telos_kernel::{Concept, ConceptId};

/// The problem state carried by a frame: refreshed concepts plus free-form
/// state features written by operators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProblemState {
    /// Concepts refreshed from the federated fabric
    pub concepts: BTreeMap<ConceptId, Concept>,
    /// Vectors resolved for those concepts
    pub vectors: BTreeMap<ConceptId, Vec<f32>>,
    /// Operator-visible scratch features
    pub features: BTreeMap<String, Value>,
}

impl ProblemState {
    /// String-valued features, as matched by chunk conditions
    pub fn string_features(&self) -> BTreeMap<String, String> {
        self.features
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }
}

/// One stack frame of the decision cycle
#[derive(Debug, Clone)]
pub struct WorkingMemoryFrame {
    /// The goal this frame is resolving
    pub goal: Goal,
    /// Problem state snapshot
    pub state: ProblemState,
    /// Operator names proposed in the current phase
    pub proposed: Vec<String>,
    /// Operator selected in the current phase
    pub selected: Option<String>,
    /// Impasse recorded by the current phase, if any
    pub impasse: Option<crate::impasse::Impasse>,
    /// Index of the parent frame in the stack
    pub parent: Option<usize>,
    /// Operators applied (in order) while this frame was on top
    pub applied: Vec<String>,
    /// Feature snapshot taken when the frame was pushed; chunk conditions
    /// compile against this, not against the mutated state
    pub condition_snapshot: BTreeMap<String, String>,
    /// Best confidence any operator achieved for this goal
    pub best_confidence: f64,
    /// Payload of the best result so far
    pub best_payload: Value,
}

impl WorkingMemoryFrame {
    /// Create a frame for a goal
    pub fn new(goal: Goal, parent: Option<usize>) -> Self {
        let condition_snapshot = goal.features.clone();
        Self {
            goal,
            state: ProblemState::default(),
            proposed: Vec::new(),
            selected: None,
            impasse: None,
            parent,
            applied: Vec::new(),
            condition_snapshot,
            best_confidence: 0.0,
            best_payload: Value::Null,
        }
    }
}

/// The frame stack. Never empty while a cycle is active; a frame is popped
/// only when its goal is resolved or abandoned.
#[derive(Debug, Default)]
pub struct WorkingMemory {
    frames: Vec<WorkingMemoryFrame>,
}

impl WorkingMemory {
    /// Start a stack with the root goal
    pub fn new(root: Goal) -> Self {
        Self {
            frames: vec![WorkingMemoryFrame::new(root, None)],
        }
    }

    /// The active (top) frame
    pub fn top(&self) -> &WorkingMemoryFrame {
        self.frames.last().expect("working memory never empty")
    }

    /// The active frame, mutably
    pub fn top_mut(&mut self) -> &mut WorkingMemoryFrame {
        self.frames.last_mut().expect("working memory never empty")
    }

    /// Push a subgoal frame linked to the current top
    pub fn push_subgoal(&mut self, goal: Goal) {
        let parent = Some(self.frames.len() - 1);
        self.frames.push(WorkingMemoryFrame::new(goal, parent));
    }

    /// Pop the top frame; refuses to empty the stack
    pub fn pop(&mut self) -> Option<WorkingMemoryFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// The root frame
    pub fn root(&self) -> &WorkingMemoryFrame {
        &self.frames[0]
    }

    /// Whether the top frame is the root
    pub fn at_root(&self) -> bool {
        self.frames.len() == 1
    }

    /// Current stack depth
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalKind;

    #[test]
    fn stack_is_never_empty() {
        let mut wm = WorkingMemory::new(Goal::new(GoalKind::Recall, "root"));
        assert!(wm.at_root());
        assert!(wm.pop().is_none());
        assert_eq!(wm.depth(), 1);
    }

    #[test]
    fn subgoals_link_to_parent_frames() {
        let root = Goal::new(GoalKind::Recall, "root");
        let mut wm = WorkingMemory::new(root.clone());
        wm.push_subgoal(root.subgoal(GoalKind::Discovery, "dig"));
        assert_eq!(wm.depth(), 2);
        assert_eq!(wm.top().parent, Some(0));
        let popped = wm.pop().unwrap();
        assert_eq!(popped.goal.kind, GoalKind::Discovery);
        assert!(wm.at_root());
    }

    #[test]
    fn condition_snapshot_is_taken_at_push() {
        let goal = Goal::new(GoalKind::Ground, "g").with_feature("text", "entropy");
        let frame = WorkingMemoryFrame::new(goal, None);
        assert_eq!(frame.condition_snapshot["text"], "entropy");
    }
}
