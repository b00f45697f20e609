//! The cycle engine: an explicit state machine over decision phases
//!
//! The engine is driven by one task at a time (the cognitive scheduler is
//! single-threaded and cooperative). Suspension points are task dispatch,
//! L3 commits, L2 searches, and the explicit yield after each phase;
//! working memory is mutated nowhere else, so it needs no locks.

use crate::builtins;
use crate::chunk::{ChunkCondition, ChunkOperator, ChunkStore, ProceduralChunk};
use crate::frame::{WorkingMemory, WorkingMemoryFrame};
use crate::goal::{Goal, GoalKind};
use crate::impasse::Impasse;
use crate::operator::{Operator, OperatorContext, OperatorRegistry};
use crate::{RECENCY_BONUS, RECENCY_WINDOW, UTILITY_TIE_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telos_bridge::SynapticBridge;
use telos_config::TelosConfig;
use telos_federation::FederatedMemory;
use telos_kernel::{ErrorKind, TelosError};
use telos_shm::HandleTable;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

/// Subgoal stacks deeper than this stop subgoaling and let the iteration
/// budget terminate the cycle.
const MAX_SUBGOAL_DEPTH: usize = 8;

/// Delay before the single retry of a `QueueFull` dispatch
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(25);

const GOAL_STREAM_CAPACITY: usize = 256;

/// Why a cycle ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleReason {
    /// Best result confidence reached `theta_success`
    Success,
    /// `cycle_iteration_limit` phases elapsed
    IterationBudget,
    /// `cycle_wall_ms` wall time elapsed
    WallClock,
    /// An external cancel was observed between phases
    Cancelled,
    /// A non-recoverable error (bridge down, persistent storage failure)
    Fatal {
        /// Error kind string from the closed taxonomy
        error: String,
    },
}

/// Outcome of one cognitive cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Whether the root goal resolved
    pub success: bool,
    /// Why the cycle ended
    pub reason: CycleReason,
    /// Best confidence achieved on the root goal
    pub confidence: f64,
    /// Payload of the best root result
    pub payload: serde_json::Value,
    /// Decision phases executed
    pub iterations: u64,
    /// Chunks compiled during this cycle
    pub chunks_compiled: usize,
}

/// Cooperative cancellation handle for a running cycle
#[derive(Clone, Default)]
pub struct CycleHandle {
    cancelled: Arc<AtomicBool>,
}

impl CycleHandle {
    /// Create an un-cancelled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the cycle cancelled; the engine completes the currently
    /// dispatched task and returns before the next phase.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancel has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The cognitive cycle engine.
///
/// Cheap to clone; clones share registry, chunks, and counters.
#[derive(Clone)]
pub struct CycleEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: Arc<OperatorRegistry>,
    chunks: ChunkStore,
    ctx: OperatorContext,
    theta_success: f64,
    theta_disc: f64,
    iteration_limit: u64,
    wall: Duration,
    goal_stream: broadcast::Sender<Goal>,
    goal_tx: mpsc::UnboundedSender<Goal>,
    goal_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Goal>>>,
    history: parking_lot::Mutex<VecDeque<(String, GoalKind)>>,
    cycles_run: AtomicU64,
    chunks_total: AtomicU64,
}

impl CycleEngine {
    /// Build an engine over the bridge and fabric, with the built-in
    /// operator complement registered.
    pub fn new(
        config: &TelosConfig,
        bridge: Arc<SynapticBridge>,
        fabric: FederatedMemory,
        table: HandleTable,
    ) -> Self {
        let registry = Arc::new(OperatorRegistry::new());
        builtins::register_builtins(&registry);

        let owner = table.register_owner();
        let ctx = OperatorContext {
            bridge,
            fabric,
            table,
            owner,
            registry: Arc::clone(&registry),
        };

        let (goal_stream, _) = broadcast::channel(GOAL_STREAM_CAPACITY);
        let (goal_tx, goal_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(EngineInner {
                registry,
                chunks: ChunkStore::new(),
                ctx,
                theta_success: config.theta_success,
                theta_disc: config.theta_disc,
                iteration_limit: config.cycle_iteration_limit,
                wall: Duration::from_millis(config.cycle_wall_ms),
                goal_stream,
                goal_tx,
                goal_rx: parking_lot::Mutex::new(Some(goal_rx)),
                history: parking_lot::Mutex::new(VecDeque::new()),
                cycles_run: AtomicU64::new(0),
                chunks_total: AtomicU64::new(0),
            }),
        }
    }

    /// The operator registry (capability synthesis appends here)
    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.inner.registry
    }

    /// Compiled chunks
    pub fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    /// Subscribe to the stream of goals the engine accepts (root goals,
    /// subgoals, and injected adaptation goals)
    pub fn subscribe_goals(&self) -> broadcast::Receiver<Goal> {
        self.inner.goal_stream.subscribe()
    }

    /// Enqueue a goal for the cognitive driver loop
    pub fn submit_goal(&self, goal: Goal) {
        let _ = self.inner.goal_tx.send(goal);
    }

    /// Take the queued-goal receiver; the runtime's cognitive driver owns it
    pub fn take_goal_receiver(&self) -> Option<mpsc::UnboundedReceiver<Goal>> {
        self.inner.goal_rx.lock().take()
    }

    /// Cycles run since construction
    pub fn cycles_run(&self) -> u64 {
        self.inner.cycles_run.load(Ordering::Relaxed)
    }

    /// Chunks compiled since construction
    pub fn chunks_compiled(&self) -> u64 {
        self.inner.chunks_total.load(Ordering::Relaxed)
    }

    /// Run one cognitive cycle to completion.
    #[instrument(skip_all, fields(goal = %goal.description, kind = ?goal.kind))]
    pub async fn run_cycle(&self, goal: Goal, handle: &CycleHandle) -> CycleReport {
        let started = Instant::now();
        self.inner.cycles_run.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.goal_stream.send(goal.clone());

        let mut wm = WorkingMemory::new(goal);
        let mut iterations = 0u64;
        let mut chunks_compiled = 0usize;

        let reason = loop {
            if handle.is_cancelled() {
                break CycleReason::Cancelled;
            }
            if iterations >= self.inner.iteration_limit {
                break CycleReason::IterationBudget;
            }
            if started.elapsed() >= self.inner.wall {
                break CycleReason::WallClock;
            }
            iterations += 1;

            // --- Input ---
            if let Err(err) = self.refresh(&mut wm) {
                if Self::is_fatal(&err) {
                    break CycleReason::Fatal {
                        error: err.kind.to_string(),
                    };
                }
                debug!(error = %err, "input refresh degraded");
            }
            tokio::task::yield_now().await;

            // --- Propose / Select / Apply ---
            let impasse = match self.decide(&mut wm, handle).await {
                Ok(impasse) => impasse,
                Err(fatal) => {
                    break CycleReason::Fatal {
                        error: fatal.kind.to_string(),
                    }
                }
            };
            tokio::task::yield_now().await;

            // --- Detect-Impasse / Subgoal ---
            if let Some(impasse) = impasse {
                debug!(impasse = impasse.as_str(), depth = wm.depth(), "impasse detected");
                let top = wm.top_mut();
                top.impasse = Some(impasse.clone());
                if wm.depth() < MAX_SUBGOAL_DEPTH {
                    let subgoal = Self::subgoal_for(wm.top(), &impasse);
                    let _ = self.inner.goal_stream.send(subgoal.clone());
                    wm.push_subgoal(subgoal);
                }
            } else {
                // --- Chunk / resolution cascade ---
                chunks_compiled += self.resolve_frames(&mut wm);
                if wm.at_root() && wm.root().best_confidence >= self.inner.theta_success {
                    break CycleReason::Success;
                }
            }
            tokio::task::yield_now().await;
        };

        let root = wm.root();
        let success = matches!(reason, CycleReason::Success);
        if success {
            info!(
                iterations,
                confidence = root.best_confidence,
                chunks = chunks_compiled,
                "cycle resolved"
            );
        } else {
            debug!(iterations, reason = ?reason, "cycle ended without resolution");
        }
        CycleReport {
            success,
            reason,
            confidence: root.best_confidence,
            payload: root.best_payload.clone(),
            iterations,
            chunks_compiled,
        }
    }

    /// Refresh working memory from the fabric for the top frame's goal
    fn refresh(&self, wm: &mut WorkingMemory) -> Result<(), TelosError> {
        let frame = wm.top_mut();
        for id in frame.goal.concepts.clone() {
            if let Some(concept) = self.inner.ctx.fabric.concept(id)? {
                frame.state.concepts.insert(id, concept);
            }
            if let Some(vector) = self.inner.ctx.fabric.read_vector(id)? {
                frame.state.vectors.insert(id, vector.as_ref().clone());
            }
        }
        Ok(())
    }

    /// Propose, select, and apply one operator on the top frame.
    /// `Ok(Some(_))` is an impasse; `Err` is fatal for the whole cycle.
    async fn decide(
        &self,
        wm: &mut WorkingMemory,
        _handle: &CycleHandle,
    ) -> Result<Option<Impasse>, TelosError> {
        let frame = wm.top_mut();

        let proposed = self.inner.registry.propose(&frame.goal, &frame.state);
        frame.proposed = proposed.iter().map(|op| op.name().to_string()).collect();
        if proposed.is_empty() {
            return Ok(Some(Impasse::OperatorNoChange));
        }

        let selected = match self.select(frame, &proposed) {
            Ok(op) => op,
            Err(impasse) => return Ok(Some(impasse)),
        };
        frame.selected = Some(selected.name().to_string());
        tokio::task::yield_now().await;

        let goal = frame.goal.clone();
        let mut outcome = selected.apply(&self.inner.ctx, &goal, &mut frame.state).await;
        if let Err(err) = &outcome {
            if err.kind == ErrorKind::QueueFull {
                // Backpressure is transient: retry once after a bounded
                // delay before declaring an impasse.
                tokio::time::sleep(BACKPRESSURE_RETRY).await;
                outcome = selected.apply(&self.inner.ctx, &goal, &mut frame.state).await;
            }
        }

        match outcome {
            Ok(result) => {
                frame.applied.push(selected.name().to_string());
                if result.confidence < self.inner.theta_disc {
                    return Ok(Some(Impasse::StateNoChange));
                }
                if result.confidence > frame.best_confidence {
                    frame.best_confidence = result.confidence;
                    frame.best_payload = result.payload;
                }
                self.record_success(selected.name(), goal.kind);
                Ok(None)
            }
            Err(err) if Self::is_fatal(&err) => Err(err),
            Err(err) => {
                warn!(operator = selected.name(), error = %err, "operator failed");
                Ok(Some(Impasse::OperatorFailure {
                    operator: selected.name().to_string(),
                    error: err.kind.to_string(),
                }))
            }
        }
    }

    /// Utility selection: U = P·G − C plus the recency bonus; argmax wins,
    /// ties leave the selection empty.
    fn select(
        &self,
        frame: &WorkingMemoryFrame,
        proposed: &[Arc<dyn Operator>],
    ) -> Result<Arc<dyn Operator>, Impasse> {
        // A resolved disambiguation subgoal pins the choice.
        if let Some(preferred) = frame
            .state
            .features
            .get("preferred_operator")
            .and_then(|v| v.as_str())
        {
            if let Some(op) = proposed.iter().find(|op| op.name() == preferred) {
                return Ok(Arc::clone(op));
            }
        }

        let mut scored: Vec<(f64, &Arc<dyn Operator>)> = proposed
            .iter()
            .map(|op| {
                let estimate = op.estimate(&frame.goal, &frame.state);
                let mut utility = estimate.utility(frame.goal.utility);
                if self.recently_succeeded(op.name(), frame.goal.kind) {
                    utility += RECENCY_BONUS;
                }
                (utility, op)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let best = scored[0].0;
        let tied: Vec<String> = scored
            .iter()
            .take_while(|(utility, _)| (best - utility).abs() < UTILITY_TIE_EPSILON)
            .map(|(_, op)| op.name().to_string())
            .collect();
        if tied.len() > 1 {
            return Err(Impasse::OperatorTie { operators: tied });
        }
        Ok(Arc::clone(scored[0].1))
    }

    /// Pop every resolved frame, compiling a chunk per resolved subgoal and
    /// propagating results into the parent. Returns chunks compiled.
    fn resolve_frames(&self, wm: &mut WorkingMemory) -> usize {
        let mut compiled = 0;
        while !wm.at_root() && wm.top().best_confidence >= self.inner.theta_success {
            let frame = wm.pop().expect("non-root frame");

            // Chunk: compile the operator sequence that resolved the
            // subgoal, conditioned on the features observed at push time.
            if !frame.applied.is_empty() {
                let chunk = Arc::new(ProceduralChunk::compile(
                    ChunkCondition {
                        goal_kind: frame.goal.kind,
                        features: frame.condition_snapshot.clone(),
                    },
                    frame.applied.clone(),
                ));
                self.inner.chunks.insert(Arc::clone(&chunk));
                self.inner.registry.register(Arc::new(ChunkOperator::new(chunk)));
                self.inner.chunks_total.fetch_add(1, Ordering::Relaxed);
                compiled += 1;
            }

            let impasse = wm.top().impasse.clone();
            let parent = wm.top_mut();
            parent.impasse = None;

            // Merge the subgoal's widened state into the parent.
            for (id, concept) in frame.state.concepts {
                parent.state.concepts.entry(id).or_insert(concept);
            }
            for (id, vector) in frame.state.vectors {
                parent.state.vectors.entry(id).or_insert(vector);
            }
            for (key, value) in frame.state.features {
                parent.state.features.entry(key).or_insert(value);
            }

            // Result propagation depends on what the subgoal was for.
            match impasse {
                Some(Impasse::OperatorNoChange) | Some(Impasse::OperatorFailure { .. }) => {
                    // The subgoal's result *is* the parent's result.
                    if frame.best_confidence > parent.best_confidence {
                        parent.best_confidence = frame.best_confidence;
                        parent.best_payload = frame.best_payload.clone();
                    }
                }
                Some(Impasse::OperatorTie { .. }) | Some(Impasse::StateNoChange) | None => {
                    // The parent retries with the enriched state.
                }
            }
        }
        compiled
    }

    fn subgoal_for(frame: &WorkingMemoryFrame, impasse: &Impasse) -> Goal {
        let kind = impasse.subgoal_kind();
        let mut subgoal = frame.goal.subgoal(
            kind,
            format!("{} ({})", frame.goal.description, impasse.as_str()),
        );
        match impasse {
            Impasse::OperatorTie { operators } => {
                subgoal = subgoal.with_feature("tied", operators.join(","));
            }
            Impasse::OperatorFailure { operator, error } => {
                subgoal = subgoal
                    .with_feature("failed_operator", operator.clone())
                    .with_feature("failure", error.clone());
            }
            Impasse::StateNoChange | Impasse::OperatorNoChange => {}
        }
        subgoal
    }

    fn record_success(&self, operator: &str, kind: GoalKind) {
        let mut history = self.inner.history.lock();
        history.push_back((operator.to_string(), kind));
        while history.len() > RECENCY_WINDOW {
            history.pop_front();
        }
    }

    fn recently_succeeded(&self, operator: &str, kind: GoalKind) -> bool {
        self.inner
            .history
            .lock()
            .iter()
            .any(|(name, k)| name == operator && *k == kind)
    }

    fn is_fatal(err: &TelosError) -> bool {
        matches!(
            err.kind,
            ErrorKind::NotInitialized | ErrorKind::StorageFailure
        )
    }

    /// Inject an adaptation goal (priority interactive) from the
    /// free-energy controller into the goal queue and stream.
    pub fn inject_adaptation(&self, strategy: impl Into<String>, description: impl Into<String>) {
        let goal = Goal::new(GoalKind::Adaptation, description)
            .with_strategy(strategy)
            .with_utility(2.0);
        self.submit_goal(goal);
    }
}
