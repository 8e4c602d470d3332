//! Core orchestration logic.
//!
//! This module contains:
//! - Task: the unit of work with its compensating revert
//! - Flow: composition of tasks, subflows and branches
//! - FlowEngine: execution with retry, isolation and rollback
//! - FlowJournal: append-only execution history
//! - Orchestrator: lifecycle operations over the flows

pub mod engine;
pub mod flow;
pub mod journal;
pub mod orchestrator;
pub mod retry;
pub mod task;

// Re-export commonly used types
pub use engine::{FlowEngine, FlowError};
pub use flow::{produced_value, Branch, Flow, Node, TaskNode};
pub use journal::{generate_idempotency_key, hash_input, list_executions, FlowJournal};
pub use orchestrator::{OrchestrationError, Orchestrator};
pub use retry::RetryPolicy;
pub use task::{
    ErrorPolicy, Outcome, Task, TaskArgs, TaskContext, TaskError, TaskOutputs, Values,
};
