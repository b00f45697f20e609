//! # TELOS Bridge - Synaptic Bridge & Worker Pool
//!
//! The marshaling layer between the orchestration tier and the compute
//! worker pool. Opaque task descriptions (tag + payload + handle list) cross
//! the bridge; large payloads travel by shared-memory handle, never by copy.
//!
//! ## Architecture
//!
//! ```text
//! submit_task ──► bounded queue (interactive ▸ batch) ──► worker threads
//!      │                                                      │
//!      │  retain input/output handles                         │ execute op
//!      ▼                                                      ▼
//!  TaskTicket ◄──────────── completion (exactly once) ◄── release handles
//! ```
//!
//! ## Guarantees
//!
//! - tasks submitted before `shutdown` complete or fail before `shutdown`
//!   returns; tasks submitted after fail with `BridgeDown`
//! - every handle listed on a task is retained at submission and released
//!   exactly once at completion, success or failure
//! - worker crashes are detected by heartbeat; in-flight tasks are
//!   resubmitted up to the configured retry budget, then fail `WorkerLost`
//! - worker-domain errors are translated into the closed bridge taxonomy;
//!   worker panics are captured verbatim, never interpreted

pub mod abi;
pub mod bridge;
pub mod error;
pub mod ops;
pub mod queue;
pub mod registry;
pub mod task;
pub mod worker;

pub use abi::{decode_frame, encode_frame, ResponseFrame, TaskFrame, WireHandle, ABI_VERSION};
pub use bridge::{BridgeMetrics, BridgeStatus, SynapticBridge, TaskTicket};
pub use error::{BridgeError, BridgeResult};
pub use registry::{OperationHandler, OperationRegistry, TaskContext};
pub use task::{Priority, Task, TaskBuilder, TaskResult};

/// Every K-th dispatch takes a batch task even when interactive work is
/// queued, so batch work cannot starve.
pub const BATCH_STARVATION_INTERVAL: u64 = 8;
