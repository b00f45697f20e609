//! The free-energy controller
//!
//! Policy: when F exceeds `free_energy_threshold` for
//! `free_energy_dwell_samples` consecutive samples, the dominant |O − P|
//! contributor maps to an adaptation strategy and an adaptation goal is
//! injected (priority interactive) through the adaptation sink the runtime
//! wired in. Finite-difference gradients over the observation stream break
//! ties between equally dominant contributors.
//!
//! A constant observed state accumulates no dwell: once the prediction has
//! converged, the squared-distance term is below the surprise floor and no
//! adaptation is ever emitted (P7).

use crate::chaos::BreachEvent;
use crate::energy::{finite_difference, free_energy, FreeEnergySample};
use crate::state::{Feature, ObservedState, StateVector};
use crate::strategy::AdaptationStrategy;
use crate::{PREDICTION_ALPHA, SURPRISE_EPSILON};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use telos_config::TelosConfig;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

const OBSERVATION_WINDOW: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where chosen adaptations go; the runtime wires this to the cognitive
/// engine's goal queue.
pub type AdaptationSink = Arc<dyn Fn(AdaptationStrategy, &FreeEnergySample) + Send + Sync>;

/// Events emitted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// A sample was evaluated
    Sampled {
        /// The evaluated functional
        sample: FreeEnergySample,
        /// Consecutive above-threshold samples so far
        dwell: u32,
    },
    /// An adaptation was triggered
    AdaptationTriggered {
        /// Chosen strategy
        strategy: AdaptationStrategy,
        /// The sample that tripped the dwell
        sample: FreeEnergySample,
    },
    /// A chaos breach was ingested
    BreachIngested {
        /// Originating experiment id
        experiment: String,
    },
}

/// Controller counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ControllerStats {
    /// Samples evaluated
    pub samples: u64,
    /// Adaptations triggered
    pub adaptations: u64,
    /// Breaches ingested from the chaos runner
    pub breaches: u64,
    /// Current consecutive above-threshold count
    pub dwell: u32,
    /// Most recent F value
    pub last_free_energy: f64,
}

/// Maintains O and P and triggers adaptation on sustained surprise.
///
/// Cheap to clone; clones share the same controller.
#[derive(Clone)]
pub struct FreeEnergyController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    threshold: f64,
    dwell_samples: u32,
    predicted: Mutex<Option<StateVector>>,
    window: Mutex<VecDeque<ObservedState>>,
    dwell: AtomicU32,
    sink: AdaptationSink,
    events: broadcast::Sender<ControllerEvent>,
    samples: AtomicU64,
    adaptations: AtomicU64,
    breaches: AtomicU64,
    last_f_millis: AtomicU64,
}

impl FreeEnergyController {
    /// Create a controller delivering adaptations into `sink`
    pub fn new(config: &TelosConfig, sink: AdaptationSink) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                threshold: config.free_energy_threshold,
                dwell_samples: config.free_energy_dwell_samples,
                predicted: Mutex::new(None),
                window: Mutex::new(VecDeque::new()),
                dwell: AtomicU32::new(0),
                sink,
                events,
                samples: AtomicU64::new(0),
                adaptations: AtomicU64::new(0),
                breaches: AtomicU64::new(0),
                last_f_millis: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    /// Evaluate one observation against the prediction, update the
    /// prediction, and trigger adaptation when the dwell trips.
    #[instrument(skip_all)]
    pub fn sample(&self, observed: StateVector) -> FreeEnergySample {
        let inner = &self.inner;
        inner.samples.fetch_add(1, Ordering::Relaxed);

        // The first observation seeds the prediction: no surprise yet.
        let mut predicted_guard = inner.predicted.lock();
        let predicted = *predicted_guard.get_or_insert(observed);
        let sample = free_energy(&observed, &predicted);
        predicted_guard
            .as_mut()
            .expect("prediction seeded")
            .ema_toward(&observed, PREDICTION_ALPHA);
        drop(predicted_guard);

        inner
            .last_f_millis
            .store((sample.free_energy * 1000.0) as u64, Ordering::Relaxed);

        let previous = {
            let mut window = inner.window.lock();
            let previous = window.back().map(|o| o.vector);
            window.push_back(ObservedState::now(observed));
            while window.len() > OBSERVATION_WINDOW {
                window.pop_front();
            }
            previous
        };

        let above = sample.free_energy > inner.threshold
            && sample.distance_squared > SURPRISE_EPSILON;
        let dwell = if above {
            inner.dwell.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            inner.dwell.store(0, Ordering::Release);
            0
        };
        let _ = inner.events.send(ControllerEvent::Sampled { sample, dwell });
        debug!(f = sample.free_energy, dwell, "free energy sampled");

        if dwell >= inner.dwell_samples {
            inner.dwell.store(0, Ordering::Release);
            let strategy = self.choose_strategy(&sample, &observed, previous.as_ref());
            inner.adaptations.fetch_add(1, Ordering::Relaxed);
            info!(
                strategy = strategy.as_str(),
                f = sample.free_energy,
                dominant = sample.dominant.as_str(),
                "adaptation triggered"
            );
            (inner.sink)(strategy, &sample);
            let _ = inner
                .events
                .send(ControllerEvent::AdaptationTriggered { strategy, sample });
        }
        sample
    }

    /// Ingest a chaos breach: the breaching sample goes through the normal
    /// sampling path, so sustained breaches trip the dwell like any other
    /// surprise.
    pub fn ingest_breach(&self, breach: &BreachEvent) -> FreeEnergySample {
        self.inner.breaches.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.send(ControllerEvent::BreachIngested {
            experiment: breach.experiment.clone(),
        });
        self.sample(breach.sample)
    }

    /// Counters snapshot
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            samples: self.inner.samples.load(Ordering::Relaxed),
            adaptations: self.inner.adaptations.load(Ordering::Relaxed),
            breaches: self.inner.breaches.load(Ordering::Relaxed),
            dwell: self.inner.dwell.load(Ordering::Relaxed),
            last_free_energy: self.inner.last_f_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Dominant contributor wins; gradients only break exact ties
    fn choose_strategy(
        &self,
        sample: &FreeEnergySample,
        observed: &StateVector,
        previous: Option<&StateVector>,
    ) -> AdaptationStrategy {
        let Some(previous) = previous else {
            return AdaptationStrategy::for_feature(sample.dominant);
        };

        let predicted = (*self.inner.predicted.lock()).unwrap_or_else(StateVector::zero);
        let differences = observed.abs_difference(&predicted);
        let dominant_magnitude = differences[sample.dominant.index()];
        let tied: Vec<Feature> = Feature::ALL
            .iter()
            .copied()
            .filter(|f| (differences[f.index()] - dominant_magnitude).abs() < 1e-12)
            .collect();
        if tied.len() <= 1 {
            return AdaptationStrategy::for_feature(sample.dominant);
        }

        // Among tied contributors, the one rising fastest wins.
        let gradient = finite_difference(observed, previous);
        let steepest = tied
            .into_iter()
            .max_by(|a, b| {
                gradient[a.index()]
                    .partial_cmp(&gradient[b.index()])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(sample.dominant);
        AdaptationStrategy::for_feature(steepest)
    }
}
