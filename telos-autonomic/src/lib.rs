//! # TELOS Autonomic - Free-Energy Controller & Chaos Runner
//!
//! The antifragile control tier. The free-energy controller maintains
//! observed- and predicted-state vectors over a fixed, ordered feature set
//! and computes the scalar functional
//!
//! ```text
//! F = ‖O − P‖² + H(O)
//! ```
//!
//! where `H` is the Shannon entropy of the observed vector normalized to
//! [0, 1]. When F exceeds its threshold for the configured dwell window,
//! the dominant contributor maps to an adaptation strategy from a closed
//! registry and an adaptation goal is injected into the cognitive engine.
//!
//! The chaos runner stresses chosen components with hypothesis-driven
//! hazards, watches a steady-state predicate, and feeds breach events to
//! the controller; it never mutates user-visible state itself.

pub mod chaos;
pub mod controller;
pub mod energy;
pub mod state;
pub mod strategy;

pub use chaos::{
    default_experiments, BreachEvent, ChaosExperiment, ChaosRunner, ExperimentReport,
    HazardHooks, HazardKind, NullHazardHooks,
};
pub use controller::{ControllerEvent, ControllerStats, FreeEnergyController};
pub use energy::{free_energy, normalized_entropy, FreeEnergySample};
pub use state::{Feature, ObservedState, StateProbe, StateVector};
pub use strategy::AdaptationStrategy;

/// Exponential-moving-average weight for the predicted-state update
pub const PREDICTION_ALPHA: f64 = 0.2;

/// Squared-distance floor below which a sample cannot accumulate dwell;
/// keeps a constant observed state from ever triggering adaptation.
pub const SURPRISE_EPSILON: f64 = 1e-9;
