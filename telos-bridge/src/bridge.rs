//! The synaptic bridge facade
//!
//! Owns the worker pool and the operation registry behind an
//! `initialize` / `shutdown` lifecycle. There is no process-global bridge;
//! the runtime context owns a `SynapticBridge` value and threads it through
//! interfaces.

use crate::error::{BridgeError, BridgeResult};
use crate::registry::OperationRegistry;
use crate::task::{Task, TaskResult};
use crate::worker::{Completion, QueuedWork, WorkerPool};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use telos_config::TelosConfig;
use telos_kernel::HandleRef;
use telos_shm::HandleTable;
use tokio::sync::oneshot;
use tracing::{info, instrument};

/// Awaitable handle to a submitted task.
///
/// Exactly one completion is observed per ticket; dropping the ticket does
/// not cancel the task.
pub struct TaskTicket {
    rx: oneshot::Receiver<BridgeResult<TaskResult>>,
    correlation_id: u64,
}

impl TaskTicket {
    /// Correlation id assigned to the task
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Await the task's single completion
    pub async fn wait(self) -> BridgeResult<TaskResult> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::BridgeDown),
        }
    }

    /// Block the current thread on the completion (worker-free contexts)
    pub fn wait_blocking(self) -> BridgeResult<TaskResult> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(BridgeError::BridgeDown),
        }
    }
}

/// Point-in-time view of bridge health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Whether the bridge is between `initialize` and `shutdown`
    pub initialized: bool,
    /// Workers whose threads are alive
    pub active_workers: usize,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Tasks currently executing
    pub in_flight: usize,
}

/// Lifetime dispatch counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BridgeMetrics {
    /// Tasks accepted by `submit_task`
    pub submitted: u64,
    /// Tasks completed `ok`
    pub completed: u64,
    /// Tasks completed with an error (excluding timeouts and losses)
    pub failed: u64,
    /// In-flight resubmissions after worker crashes
    pub retried: u64,
    /// Tasks failed on deadline expiry
    pub timed_out: u64,
    /// Tasks failed `WorkerLost` after retry exhaustion
    pub lost: u64,
}

struct BridgeCore {
    pool: WorkerPool,
    registry: OperationRegistry,
    table: HandleTable,
    correlation: AtomicU64,
}

/// The process-boundary marshaling layer between orchestration and workers
pub struct SynapticBridge {
    core: RwLock<Option<Arc<BridgeCore>>>,
}

impl SynapticBridge {
    /// Create an uninitialized bridge
    pub fn new() -> Self {
        Self {
            core: RwLock::new(None),
        }
    }

    /// Bring up the worker pool. Idempotent: re-initializing a live bridge
    /// is a no-op.
    #[instrument(skip_all)]
    pub fn initialize(
        &self,
        config: &TelosConfig,
        registry: OperationRegistry,
        table: HandleTable,
    ) -> BridgeResult<()> {
        let mut guard = self.core.write();
        if guard.is_some() {
            return Ok(());
        }

        let pool = WorkerPool::start(
            config.workers,
            config.queue_capacity,
            config.worker_heartbeat_ms,
            config.worker_retry,
            registry.clone(),
            table.clone(),
        );
        *guard = Some(Arc::new(BridgeCore {
            pool,
            registry,
            table,
            correlation: AtomicU64::new(1),
        }));
        info!(workers = config.workers, queue = config.queue_capacity, "synaptic bridge up");
        Ok(())
    }

    /// Tear down the pool. Tasks submitted before this call complete or
    /// fail before it returns; later submissions fail `BridgeDown`.
    /// Idempotent.
    #[instrument(skip_all)]
    pub fn shutdown(&self) {
        let core = self.core.write().take();
        if let Some(core) = core {
            core.pool.shutdown();
            info!("synaptic bridge down");
        }
    }

    /// Whether the bridge is currently initialized
    pub fn is_initialized(&self) -> bool {
        self.core.read().is_some()
    }

    /// Submit a task for dispatch.
    ///
    /// Applies backpressure: when the queue is full this blocks until a
    /// slot frees or the task deadline expires (`QueueFull`). Every handle
    /// listed on the task is retained here and released exactly once at
    /// completion.
    pub fn submit_task(&self, mut task: Task) -> TaskTicket {
        let (tx, rx) = oneshot::channel();

        let Some(core) = self.core.read().clone() else {
            let _ = tx.send(Err(BridgeError::BridgeDown));
            return TaskTicket {
                rx,
                correlation_id: task.correlation_id,
            };
        };

        if task.correlation_id == 0 {
            task.correlation_id = core.correlation.fetch_add(1, Ordering::Relaxed);
        }
        let correlation_id = task.correlation_id;
        let ticket = TaskTicket { rx, correlation_id };

        if !core.registry.contains(&task.operation) {
            let _ = tx.send(Err(BridgeError::InvalidTask(format!(
                "operation {} not registered",
                task.operation
            ))));
            return ticket;
        }

        // Retain every handle up front; roll back on the first failure so
        // a rejected task leaves counts untouched.
        let mut retained: Vec<HandleRef> = Vec::new();
        for href in task.all_handles() {
            if let Err(err) = core.table.retain(href) {
                for taken in &retained {
                    let _ = core.table.release(taken);
                }
                let _ = tx.send(Err(err.into()));
                return ticket;
            }
            retained.push(href.clone());
        }

        core.pool
            .counters()
            .submitted
            .fetch_add(1, Ordering::Relaxed);

        let completion = Arc::new(Completion::new(tx, retained, core.table.clone()));
        let work = QueuedWork {
            deadline_at: Instant::now() + task.deadline,
            task,
            completion,
            cancel: Arc::new(AtomicBool::new(false)),
            attempts: 0,
        };
        // Enqueue failures resolve the completion themselves.
        let _ = core.pool.enqueue(work);
        ticket
    }

    /// Bridge health snapshot
    pub fn status(&self) -> BridgeStatus {
        match self.core.read().as_ref() {
            Some(core) => BridgeStatus {
                initialized: true,
                active_workers: core.pool.active_workers(),
                queued: core.pool.queued(),
                in_flight: core.pool.in_flight(),
            },
            None => BridgeStatus {
                initialized: false,
                active_workers: 0,
                queued: 0,
                in_flight: 0,
            },
        }
    }

    /// Lifetime dispatch counters (zeroes when the bridge is down)
    pub fn metrics(&self) -> BridgeMetrics {
        match self.core.read().as_ref() {
            Some(core) => {
                let counters = core.pool.counters();
                BridgeMetrics {
                    submitted: counters.submitted.load(Ordering::Relaxed),
                    completed: counters.completed.load(Ordering::Relaxed),
                    failed: counters.failed.load(Ordering::Relaxed),
                    retried: counters.retried.load(Ordering::Relaxed),
                    timed_out: counters.timed_out.load(Ordering::Relaxed),
                    lost: counters.lost.load(Ordering::Relaxed),
                }
            }
            None => BridgeMetrics::default(),
        }
    }

    /// The operation registry, for runtime capability registration
    pub fn registry(&self) -> Option<OperationRegistry> {
        self.core.read().as_ref().map(|c| c.registry.clone())
    }
}

impl Default for SynapticBridge {
    fn default() -> Self {
        Self::new()
    }
}
