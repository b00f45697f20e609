//! Closed operation registry
//!
//! Operations are named values with typed inputs; a task whose tag is not
//! registered fails validation at submission. Runtime capability synthesis
//! is a side-channel that registers a new handler here — never a change to
//! the host program's type system.

use crate::error::{BridgeError, BridgeResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telos_shm::SegmentView;

/// Execution context handed to an operation handler on a worker thread.
///
/// Input and output views are mapped before execution; the handler never
/// touches the handle table directly and never retains a view past return.
pub struct TaskContext {
    /// Structured configuration payload
    pub config: Value,
    /// Correlation id of the task
    pub correlation_id: u64,
    inputs: Vec<SegmentView>,
    outputs: Vec<SegmentView>,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        config: Value,
        correlation_id: u64,
        inputs: Vec<SegmentView>,
        outputs: Vec<SegmentView>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            correlation_id,
            inputs,
            outputs,
            cancel,
        }
    }

    /// View over the i-th input handle
    pub fn input(&self, index: usize) -> BridgeResult<&SegmentView> {
        self.inputs
            .get(index)
            .ok_or_else(|| BridgeError::InvalidTask(format!("missing input handle {index}")))
    }

    /// View over the i-th output handle
    pub fn output(&self, index: usize) -> BridgeResult<&SegmentView> {
        self.outputs
            .get(index)
            .ok_or_else(|| BridgeError::InvalidTask(format!("missing output handle {index}")))
    }

    /// Number of input handles
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output handles
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Cooperative cancellation hook; handlers call this at loop boundaries
    pub fn check_cancelled(&self) -> BridgeResult<()> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(BridgeError::Cancelled);
        }
        Ok(())
    }
}

/// A named operation executed on a worker thread
pub trait OperationHandler: Send + Sync {
    /// Execute against mapped views; the returned payload goes into the
    /// `ok` response envelope.
    fn execute(&self, ctx: &mut TaskContext) -> BridgeResult<Value>;
}

impl<F> OperationHandler for F
where
    F: Fn(&mut TaskContext) -> BridgeResult<Value> + Send + Sync,
{
    fn execute(&self, ctx: &mut TaskContext) -> BridgeResult<Value> {
        self(ctx)
    }
}

/// Registry of operation tags to handlers
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: Arc<DashMap<String, Arc<dyn OperationHandler>>>,
}

impl OperationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry seeded with the built-in compute operations
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::ops::register_builtins(&registry);
        registry
    }

    /// Register (or replace) a handler under a tag
    pub fn register(&self, operation: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(operation.into(), handler);
    }

    /// Register a plain function as a handler
    pub fn register_fn<F>(&self, operation: impl Into<String>, f: F)
    where
        F: Fn(&mut TaskContext) -> BridgeResult<Value> + Send + Sync + 'static,
    {
        self.register(operation, Arc::new(f));
    }

    /// Whether a tag is registered
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Look up a handler
    pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation).map(|h| Arc::clone(h.value()))
    }

    /// Registered operation tags, sorted
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ops.sort();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = OperationRegistry::with_builtins();
        for op in ["vsa_bind", "vsa_unbind", "vsa_cleanup", "embed_text"] {
            assert!(registry.contains(op), "missing builtin {op}");
        }
        assert!(!registry.contains("no_such_op"));
    }

    #[test]
    fn runtime_registration_extends_the_registry() {
        let registry = OperationRegistry::new();
        registry.register_fn("federated_memory.stats", |_ctx| Ok(json!({"ok": true})));
        assert!(registry.contains("federated_memory.stats"));

        let handler = registry.get("federated_memory.stats").unwrap();
        let mut ctx = TaskContext::new(
            Value::Null,
            0,
            Vec::new(),
            Vec::new(),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(handler.execute(&mut ctx).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn cancel_flag_stops_handlers() {
        let cancel = Arc::new(AtomicBool::new(true));
        let ctx = TaskContext::new(Value::Null, 0, Vec::new(), Vec::new(), cancel);
        assert!(matches!(ctx.check_cancelled(), Err(BridgeError::Cancelled)));
    }
}
