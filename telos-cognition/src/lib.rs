//! # TELOS Cognition - The Cognitive Cycle Engine
//!
//! A cooperatively scheduled reasoning loop over the problem-space
//! computational model. One **cycle** repeats decision phases until the
//! root goal is resolved or a budget is exhausted:
//!
//! ```text
//! Input ─► Propose ─► Select ─► Apply ─► Detect-Impasse ─► Subgoal ─► Chunk
//!   ▲                                                                  │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is single-threaded and cooperative: a cycle owns its frame
//! stack and suspends only at task submissions, L3 commits, L2 searches,
//! and the explicit yield after each phase, which keeps working-memory
//! mutation free of locks.
//!
//! Unknown-message dispatch from the prototype world is replaced by the
//! operator registry: "no operator matches the current goal" is an
//! `operator-no-change` impasse, and capability synthesis is an insertion
//! into the registry, never a change to the type system.

pub mod builtins;
pub mod chunk;
pub mod engine;
pub mod frame;
pub mod goal;
pub mod impasse;
pub mod operator;

pub use chunk::{ChunkCondition, ChunkStore, ProceduralChunk};
pub use engine::{CycleEngine, CycleHandle, CycleReason, CycleReport};
pub use frame::{ProblemState, WorkingMemory, WorkingMemoryFrame};
pub use goal::{Goal, GoalKind, GoalResult};
pub use impasse::Impasse;
pub use operator::{
    Operator, OperatorContext, OperatorEstimate, OperatorOutcome, OperatorRegistry,
};

/// Additive utility bonus for operators that succeeded on a same-kind goal
/// within the recency window.
pub const RECENCY_BONUS: f64 = 0.05;

/// How many recent successes the recency window holds.
pub const RECENCY_WINDOW: usize = 32;

/// Utilities closer than this are a tie.
pub const UTILITY_TIE_EPSILON: f64 = 1e-9;
