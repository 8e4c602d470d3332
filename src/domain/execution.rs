//! Flow execution record and its reconstruction from journal events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{FlowEvent, FlowEventType, TaskState};

/// State of a flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Running,
    Succeeded,
    Reverting,
    Reverted,
    Failed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Reverted | Self::Failed)
    }
}

/// One run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: Uuid,
    pub flow_name: String,
    pub state: FlowState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Latest status per node
    pub task_states: BTreeMap<String, TaskState>,

    /// Execute attempts, counting retries
    pub executions: u32,

    /// Nodes whose results stand, in completion order (isolated ones included)
    pub completed: Vec<String>,

    /// Nodes that failed but were isolated
    pub isolated: Vec<String>,

    /// Nodes whose revert was invoked, in invocation order
    pub reverted: Vec<String>,

    /// Nodes whose revert returned an error
    pub revert_failures: Vec<String>,

    /// Branch decisions as "node -> arm"
    pub decisions: Vec<String>,

    /// The error that ended the flow
    pub error: Option<String>,

    /// Final context values (only on live executions)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
}

impl FlowExecution {
    pub fn new(id: Uuid, flow_name: impl Into<String>) -> Self {
        Self {
            id,
            flow_name: flow_name.into(),
            state: FlowState::Pending,
            started_at: Utc::now(),
            completed_at: None,
            task_states: BTreeMap::new(),
            executions: 0,
            completed: Vec::new(),
            isolated: Vec::new(),
            reverted: Vec::new(),
            revert_failures: Vec::new(),
            decisions: Vec::new(),
            error: None,
            values: BTreeMap::new(),
        }
    }

    /// Reconstruct an execution from its journal
    pub fn from_events(events: &[FlowEvent]) -> Option<Self> {
        let first = events.first()?;
        let mut execution = Self::new(first.execution_id, String::new());
        execution.started_at = first.timestamp;

        for event in events {
            execution.apply_event(event);
        }

        Some(execution)
    }

    /// Apply a single event to update execution state
    pub fn apply_event(&mut self, event: &FlowEvent) {
        let node = event.node.clone();
        match event.event_type {
            FlowEventType::FlowStarted => {
                self.state = FlowState::Running;
                self.started_at = event.timestamp;
                if self.flow_name.is_empty() {
                    self.flow_name = event.summary.clone();
                }
            }
            FlowEventType::TaskStarted => {
                self.executions += 1;
                self.set_state(node, TaskState::Running);
            }
            FlowEventType::TaskRetrying => {
                self.set_state(node, TaskState::Running);
            }
            FlowEventType::TaskSucceeded => {
                if let Some(name) = node {
                    self.completed.push(name.clone());
                    self.task_states.insert(name, TaskState::Succeeded);
                }
            }
            FlowEventType::TaskIsolated => {
                if let Some(name) = node {
                    self.completed.push(name.clone());
                    self.isolated.push(name.clone());
                    self.task_states.insert(name, TaskState::Failed);
                }
            }
            FlowEventType::TaskFailed => {
                self.set_state(node, TaskState::Failed);
                self.error = event.error.clone();
            }
            FlowEventType::BranchSelected => {
                self.decisions.push(event.summary.clone());
            }
            FlowEventType::FlowReverting => {
                self.state = FlowState::Reverting;
            }
            FlowEventType::TaskReverted => {
                if let Some(name) = node {
                    self.reverted.push(name.clone());
                    self.task_states.insert(name, TaskState::Reverted);
                }
            }
            FlowEventType::TaskRevertFailed => {
                if let Some(name) = node {
                    self.reverted.push(name.clone());
                    self.revert_failures.push(name.clone());
                    self.task_states.insert(name, TaskState::RevertFailed);
                }
            }
            FlowEventType::FlowSucceeded => {
                self.state = FlowState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            FlowEventType::FlowReverted => {
                self.state = FlowState::Reverted;
                self.completed_at = Some(event.timestamp);
            }
            FlowEventType::FlowFailed => {
                self.state = FlowState::Failed;
                self.completed_at = Some(event.timestamp);
                if event.error.is_some() {
                    self.error = event.error.clone();
                }
            }
        }
    }

    fn set_state(&mut self, node: Option<String>, state: TaskState) {
        if let Some(name) = node {
            self.task_states.insert(name, state);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn task_state(&self, node: &str) -> TaskState {
        self.task_states.get(node).copied().unwrap_or_default()
    }

    /// Typed view of a final context value.
    pub fn value<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.values
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: Uuid, node: Option<&str>, kind: FlowEventType, status: TaskState) -> FlowEvent {
        FlowEvent::new(
            id,
            node.map(str::to_string),
            kind,
            format!("{}:{}", id, node.unwrap_or("flow")),
            "create-amphora".to_string(),
            status,
        )
    }

    #[test]
    fn test_execution_from_events_tracks_rollback() {
        let id = Uuid::new_v4();
        let events = vec![
            event(id, None, FlowEventType::FlowStarted, TaskState::Running),
            event(id, Some("a"), FlowEventType::TaskStarted, TaskState::Running),
            event(id, Some("a"), FlowEventType::TaskSucceeded, TaskState::Succeeded),
            event(id, Some("b"), FlowEventType::TaskStarted, TaskState::Running),
            event(id, Some("b"), FlowEventType::TaskFailed, TaskState::Failed)
                .with_error("boom".to_string()),
            event(id, None, FlowEventType::FlowReverting, TaskState::Running),
            event(id, Some("a"), FlowEventType::TaskReverted, TaskState::Reverted),
            event(id, None, FlowEventType::FlowReverted, TaskState::Failed),
        ];

        let execution = FlowExecution::from_events(&events).unwrap();

        assert_eq!(execution.flow_name, "create-amphora");
        assert_eq!(execution.state, FlowState::Reverted);
        assert_eq!(execution.executions, 2);
        assert_eq!(execution.completed, vec!["a"]);
        assert_eq!(execution.reverted, vec!["a"]);
        assert_eq!(execution.task_state("b"), TaskState::Failed);
        assert_eq!(execution.error.as_deref(), Some("boom"));
        assert!(execution.is_finished());
    }

    #[test]
    fn test_isolated_task_counts_as_completed() {
        let id = Uuid::new_v4();
        let events = vec![
            event(id, None, FlowEventType::FlowStarted, TaskState::Running),
            event(id, Some("vrrp-0"), FlowEventType::TaskStarted, TaskState::Running),
            event(id, Some("vrrp-0"), FlowEventType::TaskIsolated, TaskState::Failed),
            event(id, None, FlowEventType::FlowSucceeded, TaskState::Succeeded),
        ];

        let execution = FlowExecution::from_events(&events).unwrap();

        assert_eq!(execution.state, FlowState::Succeeded);
        assert_eq!(execution.isolated, vec!["vrrp-0"]);
        assert_eq!(execution.completed, vec!["vrrp-0"]);
    }
}
