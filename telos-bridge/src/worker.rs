//! Worker pool with heartbeat crash detection
//!
//! Workers are identical, stateless between tasks, and pull from the
//! bounded queue. Each worker publishes a liveness heartbeat and flips an
//! alive flag through a drop guard, so a panicking handler reads as a
//! crashed worker: the monitor takes over its in-flight task, resubmits it
//! within the retry budget (then fails it `WorkerLost`), invalidates the
//! worker's owner token, reaps orphaned segments, and spawns a replacement.
//!
//! Deadlines: queued tasks that expire are failed `Timeout` at dispatch;
//! in-flight tasks past deadline are failed `Timeout` by the monitor, which
//! also raises the task's cooperative cancellation flag. Workers are never
//! forcibly terminated.

use crate::error::{BridgeError, BridgeResult};
use crate::queue::{BoundedQueue, Pop, SubmitError};
use crate::registry::{OperationRegistry, TaskContext};
use crate::task::{Task, TaskResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use telos_kernel::HandleRef;
use telos_shm::{HandleTable, OwnerToken};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// One-shot completion slot shared by queue, worker, and monitor.
///
/// Whoever resolves it first wins; the resolution releases every task
/// handle exactly once.
pub(crate) struct Completion {
    sender: Mutex<Option<oneshot::Sender<BridgeResult<TaskResult>>>>,
    handles: Vec<HandleRef>,
    table: HandleTable,
}

impl Completion {
    pub(crate) fn new(
        sender: oneshot::Sender<BridgeResult<TaskResult>>,
        handles: Vec<HandleRef>,
        table: HandleTable,
    ) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            handles,
            table,
        }
    }

    /// Resolve the task; returns false if it was already resolved
    pub(crate) fn complete(&self, result: BridgeResult<TaskResult>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        for href in &self.handles {
            // The segment may already be gone if its owner crashed; the
            // retain taken at submission is what we are returning here.
            let _ = self.table.release(href);
        }
        let _ = sender.send(result);
        true
    }

    /// Whether the task has been resolved
    pub(crate) fn is_done(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// A task queued for dispatch, with its completion plumbing
#[derive(Clone)]
pub(crate) struct QueuedWork {
    pub(crate) task: Task,
    pub(crate) completion: Arc<Completion>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) attempts: u32,
    pub(crate) deadline_at: Instant,
}

/// Lifetime counters for the pool
#[derive(Default)]
pub(crate) struct PoolCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) lost: AtomicU64,
}

struct WorkerSlot {
    alive: Arc<AtomicBool>,
    heartbeat: Arc<AtomicU64>,
    owner: OwnerToken,
    handle: Option<JoinHandle<()>>,
}

struct PoolShared {
    queue: Arc<BoundedQueue<QueuedWork>>,
    registry: OperationRegistry,
    table: HandleTable,
    in_flight: DashMap<usize, QueuedWork>,
    counters: Arc<PoolCounters>,
    workers: Mutex<Vec<WorkerSlot>>,
    heartbeat_ms: u64,
    worker_retry: u32,
    shutting_down: AtomicBool,
    started_at: Instant,
}

impl PoolShared {
    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Flips the alive flag when the worker thread unwinds or returns
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The compute worker pool
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` threads plus the heartbeat monitor
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        heartbeat_ms: u64,
        worker_retry: u32,
        registry: OperationRegistry,
        table: HandleTable,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Arc::new(BoundedQueue::new(queue_capacity)),
            registry,
            table,
            in_flight: DashMap::new(),
            counters: Arc::new(PoolCounters::default()),
            workers: Mutex::new(Vec::with_capacity(workers)),
            heartbeat_ms: heartbeat_ms.max(10),
            worker_retry,
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        {
            let mut slots = shared.workers.lock();
            for index in 0..workers.max(1) {
                slots.push(spawn_worker(&shared, index));
            }
        }

        let monitor = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("telos-bridge-monitor".to_string())
                .spawn(move || monitor_loop(shared))
                .expect("spawn bridge monitor")
        };

        Self {
            shared,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// Enqueue validated work, blocking while full until its deadline
    pub(crate) fn enqueue(&self, work: QueuedWork) -> Result<(), BridgeError> {
        let priority = work.task.priority;
        let deadline = work.deadline_at;
        match self.shared.queue.submit(work, priority, deadline) {
            Ok(()) => Ok(()),
            Err(SubmitError::Full(work)) => {
                work.completion.complete(Err(BridgeError::QueueFull));
                Err(BridgeError::QueueFull)
            }
            Err(SubmitError::Closed(work)) => {
                work.completion.complete(Err(BridgeError::BridgeDown));
                Err(BridgeError::BridgeDown)
            }
        }
    }

    /// Workers whose threads are currently alive
    pub fn active_workers(&self) -> usize {
        self.shared
            .workers
            .lock()
            .iter()
            .filter(|slot| slot.alive.load(Ordering::Acquire))
            .count()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Tasks currently executing
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub(crate) fn counters(&self) -> Arc<PoolCounters> {
        Arc::clone(&self.shared.counters)
    }

    /// Stop intake, cancel in-flight work cooperatively, drain the queue,
    /// and join every thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("worker pool shutting down");

        for entry in self.shared.in_flight.iter() {
            entry.value().cancel.store(true, Ordering::Release);
        }
        self.shared.queue.close();
        for work in self.shared.queue.drain() {
            if work.completion.complete(Err(BridgeError::Cancelled)) {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.shared.workers.lock();
            slots.iter_mut().filter_map(|s| s.handle.take()).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, index: usize) -> WorkerSlot {
    let alive = Arc::new(AtomicBool::new(true));
    let heartbeat = Arc::new(AtomicU64::new(shared.elapsed_ms()));
    let owner = shared.table.register_owner();

    let handle = {
        let shared = Arc::clone(shared);
        let alive = Arc::clone(&alive);
        let heartbeat = Arc::clone(&heartbeat);
        std::thread::Builder::new()
            .name(format!("telos-worker-{index}"))
            .spawn(move || worker_loop(shared, index, alive, heartbeat))
            .expect("spawn telos worker")
    };

    WorkerSlot {
        alive,
        heartbeat,
        owner,
        handle: Some(handle),
    }
}

fn worker_loop(
    shared: Arc<PoolShared>,
    index: usize,
    alive: Arc<AtomicBool>,
    heartbeat: Arc<AtomicU64>,
) {
    let _guard = AliveGuard(alive);
    let poll = Duration::from_millis((shared.heartbeat_ms / 2).clamp(5, 200));

    loop {
        heartbeat.store(shared.elapsed_ms(), Ordering::Release);
        match shared.queue.pop(poll) {
            Pop::TimedOut => continue,
            Pop::Closed => break,
            Pop::Item(work) => {
                if work.completion.is_done() {
                    continue;
                }
                if Instant::now() >= work.deadline_at {
                    if work.completion.complete(Err(BridgeError::Timeout)) {
                        shared.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }

                shared.in_flight.insert(index, work.clone());
                heartbeat.store(shared.elapsed_ms(), Ordering::Release);

                match run_task(&shared, &work) {
                    Ok(result) => {
                        shared.in_flight.remove(&index);
                        let counter = if result.is_ok() {
                            &shared.counters.completed
                        } else {
                            &shared.counters.failed
                        };
                        if work.completion.complete(result) {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(panic_message) => {
                        // Crash path: leave the in-flight entry for the
                        // monitor to recover, then let this thread die.
                        error!(
                            worker = index,
                            operation = %work.task.operation,
                            panic = %panic_message,
                            "worker panicked"
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Execute one task; `Err` carries a panic payload (worker crash)
fn run_task(
    shared: &PoolShared,
    work: &QueuedWork,
) -> Result<BridgeResult<TaskResult>, String> {
    let mut inputs = Vec::with_capacity(work.task.input_handles.len());
    for href in &work.task.input_handles {
        match shared.table.map(href) {
            Ok(view) => inputs.push(view),
            Err(e) => return Ok(Err(e.into())),
        }
    }
    let mut outputs = Vec::with_capacity(work.task.output_handles.len());
    for href in &work.task.output_handles {
        match shared.table.map(href) {
            Ok(view) => outputs.push(view),
            Err(e) => return Ok(Err(e.into())),
        }
    }

    let Some(handler) = shared.registry.get(&work.task.operation) else {
        return Ok(Err(BridgeError::InvalidTask(format!(
            "unknown operation {}",
            work.task.operation
        ))));
    };

    let mut ctx = TaskContext::new(
        work.task.config.clone(),
        work.task.correlation_id,
        inputs,
        outputs,
        Arc::clone(&work.cancel),
    );

    match catch_unwind(AssertUnwindSafe(|| handler.execute(&mut ctx))) {
        Ok(Ok(payload)) => Ok(Ok(TaskResult {
            payload,
            output_handles: work.task.output_handles.clone(),
            correlation_id: work.task.correlation_id,
        })),
        Ok(Err(err)) => Ok(Err(err)),
        Err(panic) => Err(panic_payload(panic)),
    }
}

fn panic_payload(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

fn monitor_loop(shared: Arc<PoolShared>) {
    let tick = Duration::from_millis((shared.heartbeat_ms / 2).clamp(5, 500));

    while !shared.shutting_down.load(Ordering::Acquire) {
        std::thread::sleep(tick);
        if shared.shutting_down.load(Ordering::Acquire) {
            break;
        }

        // Fail in-flight tasks past their deadline and raise their
        // cooperative cancellation hook.
        for entry in shared.in_flight.iter() {
            let work = entry.value();
            if !work.completion.is_done() && Instant::now() >= work.deadline_at {
                work.cancel.store(true, Ordering::Release);
                if work.completion.complete(Err(BridgeError::Timeout)) {
                    shared.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Recover crashed workers.
        let dead: Vec<usize> = {
            let slots = shared.workers.lock();
            slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.alive.load(Ordering::Acquire))
                .map(|(i, _)| i)
                .collect()
        };
        for index in dead {
            recover_worker(&shared, index);
        }

        // A live worker with no in-flight task should heartbeat every poll
        // interval; staleness here means a hung thread we cannot replace.
        let now_ms = shared.elapsed_ms();
        let slots = shared.workers.lock();
        for (index, slot) in slots.iter().enumerate() {
            let stale = now_ms.saturating_sub(slot.heartbeat.load(Ordering::Acquire));
            if slot.alive.load(Ordering::Acquire)
                && !shared.in_flight.contains_key(&index)
                && stale > shared.heartbeat_ms * 4
            {
                warn!(worker = index, stale_ms = stale, "worker heartbeat stale");
            }
        }
    }
}

fn recover_worker(shared: &Arc<PoolShared>, index: usize) {
    warn!(worker = index, "recovering crashed worker");

    if let Some((_, work)) = shared.in_flight.remove(&index) {
        if !work.completion.is_done() {
            let attempts = work.attempts + 1;
            if work.attempts < shared.worker_retry {
                shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                let resubmitted = QueuedWork {
                    attempts,
                    ..work.clone()
                };
                let priority = resubmitted.task.priority;
                let deadline = resubmitted.deadline_at;
                if shared.queue.submit(resubmitted, priority, deadline).is_err()
                    && work.completion.complete(Err(BridgeError::WorkerLost { attempts }))
                {
                    shared.counters.lost.fetch_add(1, Ordering::Relaxed);
                }
            } else if work
                .completion
                .complete(Err(BridgeError::WorkerLost { attempts }))
            {
                shared.counters.lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let mut slots = shared.workers.lock();
    let Some(slot) = slots.get_mut(index) else {
        return;
    };
    shared.table.invalidate_owner(slot.owner);
    let reaped = shared.table.reap_orphans();
    if reaped > 0 {
        debug!(worker = index, reaped, "reaped segments of crashed worker");
    }
    if let Some(handle) = slot.handle.take() {
        let _ = handle.join();
    }
    *slot = spawn_worker(shared, index);
}
