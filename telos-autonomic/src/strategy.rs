//! The closed adaptation strategy registry

use crate::state::Feature;
use serde::{Deserialize, Serialize};

/// Adaptation strategies the controller can choose from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdaptationStrategy {
    /// Relieve shared-memory and cache pressure
    MemoryManagement,
    /// Rebalance or grow the worker pool
    WorkerScaling,
    /// Retune L1 capacity and promotion
    CacheTuning,
    /// Contain a rising error rate
    ErrorContainment,
    /// Repair outbox propagation lag
    CoherenceRepair,
    /// Shed cognitive load
    LoadShedding,
}

impl AdaptationStrategy {
    /// Map a dominant feature to its strategy
    pub fn for_feature(feature: Feature) -> Self {
        match feature {
            Feature::CognitiveLoad => AdaptationStrategy::LoadShedding,
            Feature::MemoryPressure => AdaptationStrategy::MemoryManagement,
            Feature::ErrorRate => AdaptationStrategy::ErrorContainment,
            Feature::ReplicationLag => AdaptationStrategy::CoherenceRepair,
            Feature::QueueDepth => AdaptationStrategy::WorkerScaling,
            Feature::CacheMissRate => AdaptationStrategy::CacheTuning,
        }
    }

    /// Stable name injected into adaptation goals
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationStrategy::MemoryManagement => "memory-management",
            AdaptationStrategy::WorkerScaling => "worker-scaling",
            AdaptationStrategy::CacheTuning => "cache-tuning",
            AdaptationStrategy::ErrorContainment => "error-containment",
            AdaptationStrategy::CoherenceRepair => "coherence-repair",
            AdaptationStrategy::LoadShedding => "load-shedding",
        }
    }
}

impl std::fmt::Display for AdaptationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
