//! The chaos experiment runner
//!
//! Experiments are hypotheses: "under this hazard, the steady-state
//! predicate holds." The runner applies the hazard through injected hooks,
//! samples observed state every Δt, and stops on the first predicate
//! violation (a breach) or when the budget is exhausted. Breaches are fed
//! to the free-energy controller, which owns the choice of adaptation; the
//! runner itself never mutates user-visible state.

use crate::controller::FreeEnergyController;
use crate::state::{Feature, StateProbe, StateVector};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telos_kernel::{Result as KernelResult, TelosError};
use tracing::{info, instrument, warn};

/// Hazards an experiment can apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HazardKind {
    /// Delay injected into a component's hot path
    LatencyInjection,
    /// A message crafted to fail deterministically
    PoisonMessage,
    /// A record violating the expected schema
    SchemaViolation,
    /// Synthetic shared-memory pressure
    MemoryPressure,
    /// Operators forced into a utility tie
    OperatorTie,
}

impl HazardKind {
    /// Stable name for telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            HazardKind::LatencyInjection => "latency-injection",
            HazardKind::PoisonMessage => "poison-message",
            HazardKind::SchemaViolation => "schema-violation",
            HazardKind::MemoryPressure => "memory-pressure",
            HazardKind::OperatorTie => "operator-tie",
        }
    }
}

/// Steady-state predicate over observed state
pub type SteadyStatePredicate = Arc<dyn Fn(&StateVector) -> bool + Send + Sync>;

/// One registered experiment
#[derive(Clone)]
pub struct ChaosExperiment {
    /// Stable experiment id (`CEP-001`, ...)
    pub id: String,
    /// Component the hazard targets
    pub target: String,
    /// Hazard to apply
    pub hazard: HazardKind,
    /// Predicate that must hold for the system to count as nominal
    pub steady_state: SteadyStatePredicate,
    /// Sampling interval Δt
    pub sample_interval: Duration,
    /// Samples before the experiment gives up without a breach
    pub budget_samples: u32,
}

/// A steady-state violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachEvent {
    /// Originating experiment
    pub experiment: String,
    /// The breaching sample
    pub sample: StateVector,
    /// When the breach was observed
    pub observed_at: DateTime<Utc>,
}

/// Outcome of one experiment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Experiment id
    pub experiment: String,
    /// Samples taken
    pub samples: u32,
    /// The breach, if the steady state was violated
    pub breach: Option<BreachEvent>,
}

/// Hazard application surface, implemented by the runtime over dedicated
/// chaos hooks (never over user-visible state).
pub trait HazardHooks: Send + Sync {
    /// Apply the hazard for the duration of the experiment
    fn begin(&self, target: &str, hazard: HazardKind) -> KernelResult<()>;
    /// Withdraw the hazard
    fn end(&self, target: &str, hazard: HazardKind);
}

/// Hooks that apply nothing; for environments without chaos surfaces
pub struct NullHazardHooks;

impl HazardHooks for NullHazardHooks {
    fn begin(&self, _target: &str, _hazard: HazardKind) -> KernelResult<()> {
        Ok(())
    }
    fn end(&self, _target: &str, _hazard: HazardKind) {}
}

/// The default experiment registry
pub fn default_experiments() -> Vec<ChaosExperiment> {
    let quarter_second = Duration::from_millis(250);
    vec![
        ChaosExperiment {
            id: "CEP-001".to_string(),
            target: "synaptic-bridge".to_string(),
            hazard: HazardKind::LatencyInjection,
            steady_state: Arc::new(|s| s.get(Feature::QueueDepth) < 0.9),
            sample_interval: quarter_second,
            budget_samples: 40,
        },
        ChaosExperiment {
            id: "CEP-002".to_string(),
            target: "coherence-coordinator".to_string(),
            hazard: HazardKind::PoisonMessage,
            steady_state: Arc::new(|s| s.get(Feature::ReplicationLag) < 0.9),
            sample_interval: quarter_second,
            budget_samples: 40,
        },
        ChaosExperiment {
            id: "CEP-003".to_string(),
            target: "concept-store".to_string(),
            hazard: HazardKind::SchemaViolation,
            steady_state: Arc::new(|s| s.get(Feature::ErrorRate) < 0.5),
            sample_interval: quarter_second,
            budget_samples: 40,
        },
        ChaosExperiment {
            id: "CEP-004".to_string(),
            target: "cycle-engine".to_string(),
            hazard: HazardKind::OperatorTie,
            steady_state: Arc::new(|s| s.get(Feature::CognitiveLoad) < 0.9),
            sample_interval: quarter_second,
            budget_samples: 40,
        },
        ChaosExperiment {
            id: "CEP-005".to_string(),
            target: "federated-memory".to_string(),
            hazard: HazardKind::MemoryPressure,
            steady_state: Arc::new(|s| s.get(Feature::MemoryPressure) < 0.95),
            sample_interval: quarter_second,
            budget_samples: 40,
        },
    ]
}

/// Schedules hazard injections and reports breaches to the controller.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ChaosRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    experiments: RwLock<Vec<ChaosExperiment>>,
    probe: Arc<dyn StateProbe>,
    hooks: Arc<dyn HazardHooks>,
    controller: FreeEnergyController,
}

impl ChaosRunner {
    /// Create a runner seeded with the default experiment registry
    pub fn new(
        probe: Arc<dyn StateProbe>,
        hooks: Arc<dyn HazardHooks>,
        controller: FreeEnergyController,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                experiments: RwLock::new(default_experiments()),
                probe,
                hooks,
                controller,
            }),
        }
    }

    /// Register (or replace) an experiment
    pub fn register(&self, experiment: ChaosExperiment) {
        let mut experiments = self.inner.experiments.write();
        experiments.retain(|e| e.id != experiment.id);
        experiments.push(experiment);
    }

    /// Registered experiment ids, sorted
    pub fn experiment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .experiments
            .read()
            .iter()
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run one experiment to breach or budget exhaustion
    #[instrument(skip(self), fields(experiment = %experiment_id))]
    pub async fn run(&self, experiment_id: &str) -> KernelResult<ExperimentReport> {
        let experiment = self
            .inner
            .experiments
            .read()
            .iter()
            .find(|e| e.id == experiment_id)
            .cloned()
            .ok_or_else(|| TelosError::not_found(format!("experiment {experiment_id}")))?;

        info!(target = %experiment.target, hazard = experiment.hazard.as_str(), "experiment started");
        self.inner
            .hooks
            .begin(&experiment.target, experiment.hazard)?;

        let mut samples = 0u32;
        let mut breach = None;
        while samples < experiment.budget_samples {
            tokio::time::sleep(experiment.sample_interval).await;
            samples += 1;
            let observed = self.inner.probe.observe();
            if !(experiment.steady_state)(&observed) {
                warn!(sample = samples, "steady state breached");
                let event = BreachEvent {
                    experiment: experiment.id.clone(),
                    sample: observed,
                    observed_at: Utc::now(),
                };
                self.inner.controller.ingest_breach(&event);
                breach = Some(event);
                break;
            }
        }

        self.inner.hooks.end(&experiment.target, experiment.hazard);
        info!(samples, breached = breach.is_some(), "experiment finished");
        Ok(ExperimentReport {
            experiment: experiment.id,
            samples,
            breach,
        })
    }
}
