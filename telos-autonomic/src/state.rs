//! The ordered feature set and observed-state vectors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed, ordered feature set both state vectors are defined over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Working-memory depth and cycle pressure
    CognitiveLoad,
    /// Live shared-memory bytes against budget
    MemoryPressure,
    /// Failed tasks per completed task
    ErrorRate,
    /// Outbox records awaiting propagation
    ReplicationLag,
    /// Bridge queue depth against capacity
    QueueDepth,
    /// L1 miss fraction
    CacheMissRate,
}

impl Feature {
    /// Every feature, in vector order
    pub const ALL: [Feature; 6] = [
        Feature::CognitiveLoad,
        Feature::MemoryPressure,
        Feature::ErrorRate,
        Feature::ReplicationLag,
        Feature::QueueDepth,
        Feature::CacheMissRate,
    ];

    /// Index of this feature in a state vector
    pub fn index(&self) -> usize {
        Feature::ALL.iter().position(|f| f == self).unwrap_or(0)
    }

    /// Stable name used in events and strategies
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::CognitiveLoad => "cognitive-load",
            Feature::MemoryPressure => "memory-pressure",
            Feature::ErrorRate => "error-rate",
            Feature::ReplicationLag => "replication-lag",
            Feature::QueueDepth => "queue-depth",
            Feature::CacheMissRate => "cache-miss-rate",
        }
    }
}

/// A dense vector over [`Feature::ALL`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StateVector {
    values: [f64; 6],
}

impl StateVector {
    /// The zero vector
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build from raw values in feature order
    pub fn from_values(values: [f64; 6]) -> Self {
        Self { values }
    }

    /// Value of one feature
    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    /// Set one feature
    pub fn set(&mut self, feature: Feature, value: f64) {
        self.values[feature.index()] = value;
    }

    /// Builder-style set
    pub fn with(mut self, feature: Feature, value: f64) -> Self {
        self.set(feature, value);
        self
    }

    /// Raw values in feature order
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Squared Euclidean distance to another vector
    pub fn distance_squared(&self, other: &StateVector) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    /// Elementwise |self − other|, for dominant-contributor analysis
    pub fn abs_difference(&self, other: &StateVector) -> [f64; 6] {
        let mut out = [0.0; 6];
        for (i, (a, b)) in self.values.iter().zip(other.values.iter()).enumerate() {
            out[i] = (a - b).abs();
        }
        out
    }

    /// EMA update toward `observation` with weight `alpha`
    pub fn ema_toward(&mut self, observation: &StateVector, alpha: f64) {
        for (p, o) in self.values.iter_mut().zip(observation.values.iter()) {
            *p = (1.0 - alpha) * *p + alpha * o;
        }
    }
}

/// A timestamped observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// The observed vector
    pub vector: StateVector,
    /// When it was sampled
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    /// Timestamp an observation now
    pub fn now(vector: StateVector) -> Self {
        Self {
            vector,
            observed_at: Utc::now(),
        }
    }
}

/// Source of observed state, implemented by the runtime over live
/// component counters
pub trait StateProbe: Send + Sync {
    /// Sample the current observed-state vector
    fn observe(&self) -> StateVector;
}

impl<F> StateProbe for F
where
    F: Fn() -> StateVector + Send + Sync,
{
    fn observe(&self) -> StateVector {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_indices_are_stable() {
        for (i, feature) in Feature::ALL.iter().enumerate() {
            assert_eq!(feature.index(), i);
        }
    }

    #[test]
    fn distance_and_difference() {
        let a = StateVector::from_values([1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let b = StateVector::from_values([0.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert!((a.distance_squared(&b) - 5.0).abs() < 1e-12);
        let diff = a.abs_difference(&b);
        assert_eq!(diff[0], 1.0);
        assert_eq!(diff[1], 2.0);
    }

    #[test]
    fn ema_converges_on_constant_input() {
        let target = StateVector::from_values([0.5; 6]);
        let mut predicted = StateVector::zero();
        for _ in 0..100 {
            predicted.ema_toward(&target, 0.2);
        }
        assert!(predicted.distance_squared(&target) < 1e-6);
    }
}
