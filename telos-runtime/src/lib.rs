//! # TELOS Runtime - The Explicit Runtime Context
//!
//! There are no process-global singletons in TELOS: every subsystem is a
//! value owned by [`TelosRuntime`], wired together at `initialize` and torn
//! down at `shutdown`. The runtime owns:
//!
//! - the handle table and the synaptic bridge over it
//! - the three memory tiers and their coherence coordinator
//! - the cognitive cycle engine and its goal driver loop
//! - the free-energy controller, its sampling loop, and the chaos runner
//!
//! ```no_run
//! use telos_config::TelosConfig;
//! use telos_runtime::TelosRuntime;
//!
//! # async fn example() -> telos_kernel::Result<()> {
//! let runtime = TelosRuntime::initialize(TelosConfig::default()).await?;
//! let status = runtime.status();
//! assert!(status.bridge.initialized);
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod handlers;
mod telemetry;

pub use handlers::register_runtime_operations;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telos_ann::{AnnIndex, AnnParams};
use telos_autonomic::{
    ChaosRunner, ControllerStats, Feature, FreeEnergyController, HazardHooks, HazardKind,
    StateProbe, StateVector,
};
use telos_bridge::{BridgeStatus, OperationRegistry, SynapticBridge};
use telos_cache::VectorCache;
use telos_cognition::{CycleEngine, CycleHandle, CycleReport, Goal};
use telos_config::TelosConfig;
use telos_federation::{CoherenceCoordinator, FabricStats, FederatedMemory};
use telos_kernel::{Dtype, ErrorKind, Result as KernelResult, TelosError};
use telos_shm::{HandleTable, OwnerToken, SharedHandle};
use telos_store::ConceptStore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Cadence of the free-energy sampling loop
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Combined runtime health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Bridge health
    pub bridge: BridgeStatus,
    /// Memory fabric counters
    pub fabric: FabricStats,
    /// Controller counters
    pub controller: ControllerStats,
    /// Cycles run by the engine
    pub cycles_run: u64,
    /// Chunks compiled by the engine
    pub chunks_compiled: u64,
}

/// The runtime context owning every TELOS subsystem
pub struct TelosRuntime {
    config: TelosConfig,
    table: HandleTable,
    bridge: Arc<SynapticBridge>,
    fabric: FederatedMemory,
    engine: CycleEngine,
    controller: FreeEnergyController,
    chaos: ChaosRunner,
    driver: Mutex<Option<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl TelosRuntime {
    /// Bring up every subsystem under one lifecycle.
    #[instrument(skip_all)]
    pub async fn initialize(config: TelosConfig) -> KernelResult<Self> {
        telemetry::init();
        config
            .validate()
            .map_err(|e| TelosError::new(ErrorKind::InvalidArgument, e.to_string()))?;

        let table = HandleTable::new();
        let registry = OperationRegistry::with_builtins();
        let bridge = Arc::new(SynapticBridge::new());
        bridge
            .initialize(&config, registry.clone(), table.clone())
            .map_err(TelosError::from)?;

        let store =
            ConceptStore::open(config.data_dir.join("l3")).map_err(TelosError::from)?;
        let index = AnnIndex::open(
            config.data_dir.join("l2"),
            AnnParams {
                graph_degree: config.l2_graph_degree,
                beam_width: config.l2_beam_width,
                alpha: config.l2_alpha,
            },
        )
        .map_err(TelosError::from)?;
        let cache = VectorCache::new(config.l1_capacity_bytes);
        let coordinator =
            CoherenceCoordinator::new(&config, store.clone(), index.clone(), cache.clone());
        coordinator.start();
        let fabric = FederatedMemory::new(store, index, cache, coordinator);

        let engine = CycleEngine::new(
            &config,
            Arc::clone(&bridge),
            fabric.clone(),
            table.clone(),
        );
        register_runtime_operations(&registry, fabric.clone(), Arc::downgrade(&bridge));

        // Controller: adaptation goals flow into the engine's goal queue
        // with interactive priority.
        let sink_engine = engine.clone();
        let controller = FreeEnergyController::new(
            &config,
            Arc::new(move |strategy, sample| {
                sink_engine.inject_adaptation(
                    strategy.as_str(),
                    format!(
                        "free energy {:.3} sustained; dominant contributor {}",
                        sample.free_energy,
                        sample.dominant.as_str()
                    ),
                );
            }),
        );

        let probe: Arc<dyn StateProbe> = Arc::new(RuntimeProbe {
            bridge: Arc::clone(&bridge),
            fabric: fabric.clone(),
            table: table.clone(),
            queue_capacity: config.queue_capacity,
            memory_budget_bytes: config.l1_capacity_bytes,
        });
        let hooks: Arc<dyn HazardHooks> = Arc::new(RuntimeHazardHooks::new(
            table.clone(),
            config.l1_capacity_bytes,
        ));
        let chaos = ChaosRunner::new(Arc::clone(&probe), hooks, controller.clone());

        // Cognitive driver: one cycle at a time off the goal queue.
        let driver = {
            let engine = engine.clone();
            let mut goals = engine
                .take_goal_receiver()
                .expect("goal receiver taken once at initialize");
            tokio::spawn(async move {
                while let Some(goal) = goals.recv().await {
                    let report = engine.run_cycle(goal, &CycleHandle::new()).await;
                    if !report.success {
                        warn!(reason = ?report.reason, "queued goal did not resolve");
                    }
                }
            })
        };

        // Free-energy sampler.
        let sampler = {
            let controller = controller.clone();
            let probe = Arc::clone(&probe);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    controller.sample(probe.observe());
                }
            })
        };

        info!(workers = config.workers, data_dir = %config.data_dir.display(), "telos runtime up");
        Ok(Self {
            config,
            table,
            bridge,
            fabric,
            engine,
            controller,
            chaos,
            driver: Mutex::new(Some(driver)),
            sampler: Mutex::new(Some(sampler)),
        })
    }

    /// The active configuration
    pub fn config(&self) -> &TelosConfig {
        &self.config
    }

    /// The handle table
    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    /// The synaptic bridge
    pub fn bridge(&self) -> &Arc<SynapticBridge> {
        &self.bridge
    }

    /// The federated memory fabric
    pub fn fabric(&self) -> &FederatedMemory {
        &self.fabric
    }

    /// The cognitive cycle engine
    pub fn engine(&self) -> &CycleEngine {
        &self.engine
    }

    /// The free-energy controller
    pub fn controller(&self) -> &FreeEnergyController {
        &self.controller
    }

    /// The chaos experiment runner
    pub fn chaos(&self) -> &ChaosRunner {
        &self.chaos
    }

    /// Run one goal to completion on the caller's task
    pub async fn run_goal(&self, goal: Goal) -> CycleReport {
        self.engine.run_cycle(goal, &CycleHandle::new()).await
    }

    /// Allocate and fill an f32 segment; a convenience for embedding hosts
    pub fn allocate_vector(
        &self,
        owner: OwnerToken,
        data: &[f32],
    ) -> KernelResult<SharedHandle> {
        let handle = self
            .table
            .allocate(data.len(), Dtype::F32, owner)
            .map_err(TelosError::from)?;
        self.table
            .map(handle.href())
            .map_err(TelosError::from)?
            .write_f32(data)
            .map_err(TelosError::from)?;
        Ok(handle)
    }

    /// Combined health snapshot
    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            bridge: self.bridge.status(),
            fabric: self.fabric.stats().unwrap_or(FabricStats {
                l1: Default::default(),
                l2: Default::default(),
                l3_concepts: 0,
                l3_sequence: 0,
                outbox_pending: 0,
                outbox_dead: 0,
            }),
            controller: self.controller.stats(),
            cycles_run: self.engine.cycles_run(),
            chunks_compiled: self.engine.chunks_compiled(),
        }
    }

    /// Tear everything down: loops first, then the coordinator, then the
    /// bridge (draining its queue), then a final L2 snapshot. Idempotent.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        if let Some(sampler) = self.sampler.lock().take() {
            sampler.abort();
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.fabric.coordinator().stop().await;
        self.bridge.shutdown();
        if let Err(err) = self.fabric.index().save() {
            warn!(error = %err, "final index snapshot failed");
        }
        info!("telos runtime down");
    }
}

/// Observed-state probe over the live components
struct RuntimeProbe {
    bridge: Arc<SynapticBridge>,
    fabric: FederatedMemory,
    table: HandleTable,
    queue_capacity: usize,
    memory_budget_bytes: usize,
}

impl StateProbe for RuntimeProbe {
    fn observe(&self) -> StateVector {
        let bridge_status = self.bridge.status();
        let metrics = self.bridge.metrics();
        let shm = self.table.stats();
        let (l1, outbox_pending) = match self.fabric.stats() {
            Ok(stats) => (stats.l1, stats.outbox_pending),
            Err(_) => (Default::default(), 0),
        };

        let total_tasks = metrics.completed + metrics.failed + metrics.lost;
        let error_rate = if total_tasks > 0 {
            (metrics.failed + metrics.lost) as f64 / total_tasks as f64
        } else {
            0.0
        };
        let lookups = l1.hits + l1.misses;
        let miss_rate = if lookups > 0 {
            l1.misses as f64 / lookups as f64
        } else {
            0.0
        };
        let workers = bridge_status.active_workers.max(1);

        StateVector::zero()
            .with(
                Feature::CognitiveLoad,
                bridge_status.in_flight as f64 / workers as f64,
            )
            .with(
                Feature::MemoryPressure,
                shm.live_bytes as f64 / self.memory_budget_bytes.max(1) as f64,
            )
            .with(Feature::ErrorRate, error_rate)
            .with(Feature::ReplicationLag, outbox_pending as f64 / 100.0)
            .with(
                Feature::QueueDepth,
                bridge_status.queued as f64 / self.queue_capacity.max(1) as f64,
            )
            .with(Feature::CacheMissRate, miss_rate)
    }
}

/// Hazard surfaces that stress dedicated resources, never user state
struct RuntimeHazardHooks {
    table: HandleTable,
    owner: OwnerToken,
    budget_bytes: usize,
    held: Mutex<Vec<SharedHandle>>,
}

impl RuntimeHazardHooks {
    fn new(table: HandleTable, budget_bytes: usize) -> Self {
        let owner = table.register_owner();
        Self {
            table,
            owner,
            budget_bytes,
            held: Mutex::new(Vec::new()),
        }
    }
}

impl HazardHooks for RuntimeHazardHooks {
    fn begin(&self, target: &str, hazard: HazardKind) -> KernelResult<()> {
        match hazard {
            HazardKind::MemoryPressure => {
                // Fill the shared-memory budget with ballast segments the
                // probe counts as live bytes.
                let segment_elements = (self.budget_bytes / 4 / 8).max(1);
                let mut held = self.held.lock();
                for _ in 0..9 {
                    held.push(
                        self.table
                            .allocate(segment_elements, Dtype::F32, self.owner)
                            .map_err(TelosError::from)?,
                    );
                }
                Ok(())
            }
            other => {
                // Remaining hazards are applied by component-level fault
                // injectors wired per experiment.
                info!(target, hazard = other.as_str(), "hazard has no runtime-level surface");
                Ok(())
            }
        }
    }

    fn end(&self, _target: &str, hazard: HazardKind) {
        if hazard == HazardKind::MemoryPressure {
            for handle in self.held.lock().drain(..) {
                let _ = self.table.release(handle.href());
            }
        }
    }
}
