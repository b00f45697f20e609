//! The free-energy functional F = ‖O − P‖² + H(O)

use crate::state::{Feature, StateVector};
use serde::{Deserialize, Serialize};

/// One evaluated sample of the functional
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreeEnergySample {
    /// The scalar F
    pub free_energy: f64,
    /// ‖O − P‖² term
    pub distance_squared: f64,
    /// H(O) term, in [0, 1]
    pub entropy: f64,
    /// Feature with the largest |O − P| contribution
    pub dominant: Feature,
}

/// Shannon entropy of the observed vector, normalized to [0, 1].
///
/// The vector's absolute values are renormalized into a distribution; a
/// zero or single-spike vector has entropy 0, a uniform vector entropy 1.
pub fn normalized_entropy(observed: &StateVector) -> f64 {
    let magnitudes: Vec<f64> = observed.as_slice().iter().map(|v| v.abs()).collect();
    let total: f64 = magnitudes.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut entropy = 0.0;
    for magnitude in &magnitudes {
        let p = magnitude / total;
        if p > 0.0 {
            entropy -= p * p.ln();
        }
    }
    entropy / (magnitudes.len() as f64).ln()
}

/// Evaluate F for an observation against the current prediction
pub fn free_energy(observed: &StateVector, predicted: &StateVector) -> FreeEnergySample {
    let distance_squared = observed.distance_squared(predicted);
    let entropy = normalized_entropy(observed);
    let differences = observed.abs_difference(predicted);
    let dominant = Feature::ALL
        .iter()
        .copied()
        .max_by(|a, b| {
            differences[a.index()]
                .partial_cmp(&differences[b.index()])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(Feature::CognitiveLoad);

    FreeEnergySample {
        free_energy: distance_squared + entropy,
        distance_squared,
        entropy,
        dominant,
    }
}

/// Finite-difference gradient over two successive observations, used only
/// to break ties between candidate strategies.
pub fn finite_difference(current: &StateVector, previous: &StateVector) -> [f64; 6] {
    let mut gradient = [0.0; 6];
    for (i, (c, p)) in current
        .as_slice()
        .iter()
        .zip(previous.as_slice().iter())
        .enumerate()
    {
        gradient[i] = c - p;
    }
    gradient
}
