//! Task descriptions and results

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use telos_kernel::HandleRef;

/// Dispatch priority class.
///
/// `Interactive` strictly precedes `Batch`; starvation avoidance takes one
/// batch task every [`crate::BATCH_STARVATION_INTERVAL`] dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Cognitive-cycle work awaiting a result
    #[default]
    Interactive,
    /// Background maintenance and bulk work
    Batch,
}

/// An opaque unit of work dispatched across the bridge
#[derive(Debug, Clone)]
pub struct Task {
    /// Operation tag, drawn from the closed registry
    pub operation: String,
    /// Structured configuration payload
    pub config: Value,
    /// Ordered input handles; retained for the task's lifetime
    pub input_handles: Vec<HandleRef>,
    /// Ordered output handles, pre-allocated by the caller
    pub output_handles: Vec<HandleRef>,
    /// Time budget from submission
    pub deadline: Duration,
    /// Correlation id carried through completion and telemetry
    pub correlation_id: u64,
    /// Dispatch class
    pub priority: Priority,
}

impl Task {
    /// Start building a task for the named operation
    pub fn builder(operation: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(operation)
    }

    /// All handles referenced by this task, inputs first
    pub fn all_handles(&self) -> impl Iterator<Item = &HandleRef> {
        self.input_handles.iter().chain(self.output_handles.iter())
    }
}

/// Builder for [`Task`]
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    operation: String,
    config: Value,
    input_handles: Vec<HandleRef>,
    output_handles: Vec<HandleRef>,
    deadline: Duration,
    correlation_id: Option<u64>,
    priority: Priority,
}

impl TaskBuilder {
    fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            config: Value::Null,
            input_handles: Vec::new(),
            output_handles: Vec::new(),
            deadline: Duration::from_secs(30),
            correlation_id: None,
            priority: Priority::Interactive,
        }
    }

    /// Set the configuration payload
    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Append an input handle
    pub fn input(mut self, handle: HandleRef) -> Self {
        self.input_handles.push(handle);
        self
    }

    /// Append a pre-allocated output handle
    pub fn output(mut self, handle: HandleRef) -> Self {
        self.output_handles.push(handle);
        self
    }

    /// Set the deadline
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set an explicit correlation id (otherwise assigned at submission)
    pub fn correlation_id(mut self, id: u64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the dispatch class
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Finish the builder
    pub fn build(self) -> Task {
        Task {
            operation: self.operation,
            config: self.config,
            input_handles: self.input_handles,
            output_handles: self.output_handles,
            deadline: self.deadline,
            correlation_id: self.correlation_id.unwrap_or(0),
            priority: self.priority,
        }
    }
}

/// Successful task completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Operation-specific payload
    pub payload: Value,
    /// The output handles, now populated
    pub output_handles: Vec<HandleRef>,
    /// Correlation id echoed from the task
    pub correlation_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use telos_kernel::Dtype;

    #[test]
    fn builder_defaults() {
        let task = Task::builder("vsa_bind").build();
        assert_eq!(task.operation, "vsa_bind");
        assert_eq!(task.priority, Priority::Interactive);
        assert_eq!(task.deadline, Duration::from_secs(30));
    }

    #[test]
    fn all_handles_orders_inputs_first() {
        let href = |name: &str| HandleRef {
            name: name.to_string(),
            dtype: Dtype::F32,
            element_count: 2,
        };
        let task = Task::builder("vsa_bind")
            .input(href("a"))
            .input(href("b"))
            .output(href("out"))
            .config(json!({"k": 1}))
            .build();
        let names: Vec<_> = task.all_handles().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "out"]);
    }
}
