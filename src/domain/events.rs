//! Journal events for flow executions.
//!
//! Every state change of a flow or one of its tasks is recorded as an
//! immutable event. The execution record is derived by applying them in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a flow journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The flow execution this event belongs to
    pub execution_id: Uuid,

    /// Node name (absent for flow-level events)
    pub node: Option<String>,

    /// Type of event
    pub event_type: FlowEventType,

    /// Idempotency key format: "{execution_id}:{node}:{args_hash}"
    pub idempotency_key: String,

    /// Human-readable summary
    pub summary: String,

    /// Status of the node after this event
    pub status: TaskState,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl FlowEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        execution_id: Uuid,
        node: Option<String>,
        event_type: FlowEventType,
        idempotency_key: String,
        summary: String,
        status: TaskState,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution_id,
            node,
            event_type,
            idempotency_key,
            summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    FlowStarted,
    TaskStarted,
    TaskSucceeded,
    /// Failed with a retryable error, another attempt follows
    TaskRetrying,
    TaskFailed,
    /// Failed, but the task's policy is to mark and continue
    TaskIsolated,
    BranchSelected,
    FlowReverting,
    TaskReverted,
    TaskRevertFailed,
    FlowSucceeded,
    FlowReverted,
    FlowFailed,
}

/// Status of a task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Reverted,
    RevertFailed,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}
