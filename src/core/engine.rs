//! Workflow engine.
//!
//! Runs a flow's nodes in order against a shared value context, retries
//! transient failures, isolates failures of best-effort tasks and, when a
//! task fails for good, reverts every completed task in reverse order.
//! Every state change is an event, applied to the execution record and
//! appended to the journal when one is configured.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{FlowEvent, FlowEventType, FlowExecution, TaskState};

use super::flow::{Flow, Node, TaskNode};
use super::journal::{generate_idempotency_key, FlowJournal};
use super::retry::RetryPolicy;
use super::task::{ErrorPolicy, Outcome, TaskArgs, TaskContext, TaskError, TaskOutputs, Values};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow '{flow}' is missing inputs: {}", missing.join(", "))]
    MissingInputs { flow: String, missing: Vec<String> },

    #[error("flow '{flow}' failed at task '{task}': {source}")]
    TaskFailed {
        flow: String,
        task: String,
        source: TaskError,
        execution: Box<FlowExecution>,
    },
}

impl FlowError {
    /// The execution record, when the flow got as far as running tasks.
    pub fn execution(&self) -> Option<&FlowExecution> {
        match self {
            Self::TaskFailed { execution, .. } => Some(execution),
            Self::MissingInputs { .. } => None,
        }
    }

    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Self::TaskFailed { source, .. } => Some(source),
            Self::MissingInputs { .. } => None,
        }
    }
}

/// Executes flows against one set of collaborators.
#[derive(Clone)]
pub struct FlowEngine {
    ctx: TaskContext,
    journal_dir: Option<PathBuf>,
}

/// A task whose result stands, kept for rollback.
struct Completed {
    node: TaskNode,
    args: TaskArgs,
    outcome: Outcome,
}

/// Mutable state of one execution.
struct RunState {
    execution: FlowExecution,
    journal: Option<FlowJournal>,
    values: Values,
    /// Outputs per node name, one entry per pass, under the task's own names
    history: BTreeMap<String, Vec<Values>>,
    completed: Vec<Completed>,
}

impl RunState {
    async fn emit(&mut self, event: FlowEvent) {
        self.execution.apply_event(&event);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event).await {
                warn!(execution_id = %self.execution.id, error = %e, "Failed to journal event");
            }
        }
    }

    fn id(&self) -> Uuid {
        self.execution.id
    }
}

impl FlowEngine {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            journal_dir: None,
        }
    }

    /// Journal every execution under `dir`.
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn journal_dir(&self) -> Option<&PathBuf> {
        self.journal_dir.as_ref()
    }

    /// Run `flow` to completion or full rollback.
    #[instrument(skip(self, flow, inputs), fields(flow = %flow.name()))]
    pub async fn run(&self, flow: &Flow, inputs: Values) -> Result<FlowExecution, FlowError> {
        let execution_id = Uuid::new_v4();
        let journal = match &self.journal_dir {
            Some(dir) => match FlowJournal::open(dir, execution_id).await {
                Ok(journal) => Some(journal),
                Err(e) => {
                    warn!(%execution_id, error = %e, "Journal unavailable, running without one");
                    None
                }
            },
            None => None,
        };

        let mut state = RunState {
            execution: FlowExecution::new(execution_id, flow.name()),
            journal,
            values: inputs,
            history: BTreeMap::new(),
            completed: Vec::new(),
        };

        info!(%execution_id, "Starting flow");
        state
            .emit(FlowEvent::new(
                execution_id,
                None,
                FlowEventType::FlowStarted,
                format!("{}:start", execution_id),
                flow.name().to_string(),
                TaskState::Running,
            ))
            .await;

        let missing: Vec<String> = flow
            .requires()
            .into_iter()
            .filter(|name| !state.values.contains_key(name))
            .collect();
        if !missing.is_empty() {
            let message = format!("missing inputs: {}", missing.join(", "));
            error!(%execution_id, %message, "Flow cannot start");
            state
                .emit(
                    FlowEvent::new(
                        execution_id,
                        None,
                        FlowEventType::FlowFailed,
                        format!("{}:complete", execution_id),
                        format!("Flow '{}' failed: {}", flow.name(), message),
                        TaskState::Failed,
                    )
                    .with_error(message),
                )
                .await;
            return Err(FlowError::MissingInputs {
                flow: flow.name().to_string(),
                missing,
            });
        }

        let mut cursors = vec![flow.nodes().iter()];
        while let Some(cursor) = cursors.last_mut() {
            let Some(node) = cursor.next() else {
                cursors.pop();
                continue;
            };

            match node {
                Node::Task(task) => {
                    if let Err(e) = self.run_task(&mut state, task).await {
                        self.rollback(&mut state).await;
                        state.execution.values = state.values;
                        return Err(FlowError::TaskFailed {
                            flow: flow.name().to_string(),
                            task: task.name().to_string(),
                            source: e,
                            execution: Box::new(state.execution),
                        });
                    }
                }
                Node::Flow(subflow) => {
                    debug!(subflow = %subflow.name(), "Entering subflow");
                    cursors.push(subflow.nodes().iter());
                }
                Node::Branch(branch) => {
                    let history = state
                        .history
                        .get(branch.watched())
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    let arm = branch.decide(history);
                    info!(branch = %branch.name(), arm = %arm.name(), "Branch selected");
                    state
                        .emit(FlowEvent::new(
                            execution_id,
                            Some(branch.name().to_string()),
                            FlowEventType::BranchSelected,
                            format!("{}:{}:decide", execution_id, branch.name()),
                            format!("{} -> {}", branch.name(), arm.name()),
                            TaskState::Succeeded,
                        ))
                        .await;
                    cursors.push(arm.nodes().iter());
                }
            }
        }

        info!(%execution_id, "Flow completed successfully");
        state
            .emit(FlowEvent::new(
                execution_id,
                None,
                FlowEventType::FlowSucceeded,
                format!("{}:complete", execution_id),
                format!("Flow '{}' completed", flow.name()),
                TaskState::Succeeded,
            ))
            .await;

        state.execution.values = state.values;
        Ok(state.execution)
    }

    /// Execute one task node with retry, isolating its failure when allowed.
    async fn run_task(&self, state: &mut RunState, node: &TaskNode) -> Result<(), TaskError> {
        let args = match resolve_args(node, &state.values) {
            Ok(args) => args,
            Err(e) => {
                state
                    .emit(
                        FlowEvent::new(
                            state.id(),
                            Some(node.name().to_string()),
                            FlowEventType::TaskFailed,
                            format!("{}:{}:unresolved", state.id(), node.name()),
                            format!("Task '{}' could not start: {}", node.name(), e),
                            TaskState::Failed,
                        )
                        .with_error(e.to_string()),
                    )
                    .await;
                error!(task = %node.name(), error = %e, "Task inputs unresolved");
                return Err(e);
            }
        };
        let idem_key = generate_idempotency_key(state.id(), node.name(), &args.fingerprint());
        let policy = node.retry_policy().cloned().unwrap_or_else(RetryPolicy::once);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();

            state
                .emit(FlowEvent::new(
                    state.id(),
                    Some(node.name().to_string()),
                    FlowEventType::TaskStarted,
                    idem_key.clone(),
                    format!("Task '{}' attempt {}", node.name(), attempt),
                    TaskState::Running,
                ))
                .await;

            let result = self.execute_once(node, &args).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let e = match result {
                Ok(outputs) => {
                    state
                        .emit(
                            FlowEvent::new(
                                state.id(),
                                Some(node.name().to_string()),
                                FlowEventType::TaskSucceeded,
                                idem_key,
                                format!("Task '{}' completed in {}ms", node.name(), duration_ms),
                                TaskState::Succeeded,
                            )
                            .with_duration(duration_ms),
                        )
                        .await;
                    self.record(state, node, args, &outputs);
                    return Ok(());
                }
                Err(e) => e,
            };

            if e.is_retryable() && policy.should_retry(attempt) {
                let delay = policy.delay_for_attempt(attempt);
                state
                    .emit(
                        FlowEvent::new(
                            state.id(),
                            Some(node.name().to_string()),
                            FlowEventType::TaskRetrying,
                            format!("{}:retry:{}", idem_key, attempt),
                            format!(
                                "Task '{}' failed, retrying in {:?}: {}",
                                node.name(),
                                delay,
                                e
                            ),
                            TaskState::Running,
                        )
                        .with_error(e.to_string()),
                    )
                    .await;

                warn!(
                    task = %node.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Task failed, retrying"
                );

                tokio::time::sleep(delay).await;
                continue;
            }

            if node.error_policy() == ErrorPolicy::IsolateAndContinue {
                warn!(
                    task = %node.name(),
                    attempt,
                    error = %e,
                    "Task failed, isolating and continuing"
                );
                node.task().on_isolated_failure(&self.ctx, &args, &e).await;
                state
                    .emit(
                        FlowEvent::new(
                            state.id(),
                            Some(node.name().to_string()),
                            FlowEventType::TaskIsolated,
                            idem_key,
                            format!("Task '{}' failed and was isolated: {}", node.name(), e),
                            TaskState::Failed,
                        )
                        .with_duration(duration_ms)
                        .with_error(e.to_string()),
                    )
                    .await;
                self.record_isolated(state, node, args, &e);
                return Ok(());
            }

            state
                .emit(
                    FlowEvent::new(
                        state.id(),
                        Some(node.name().to_string()),
                        FlowEventType::TaskFailed,
                        idem_key,
                        format!(
                            "Task '{}' failed after {} attempts: {}",
                            node.name(),
                            attempt,
                            e
                        ),
                        TaskState::Failed,
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string()),
                )
                .await;

            error!(task = %node.name(), attempt, error = %e, "Task failed permanently");
            return Err(e);
        }
    }

    async fn execute_once(&self, node: &TaskNode, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let work = node.task().execute(&self.ctx, args);
        match node.time_limit() {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(TaskError::Timeout(limit))),
            None => work.await,
        }
    }

    fn record(&self, state: &mut RunState, node: &TaskNode, args: TaskArgs, outputs: &TaskOutputs) {
        let mut produced = Values::new();
        for name in node.task().provides() {
            let value = outputs.get(name).cloned().unwrap_or(Value::Null);
            state
                .values
                .insert(node.target_of(name).to_string(), value.clone());
            produced.insert(name.to_string(), value);
        }
        state
            .history
            .entry(node.name().to_string())
            .or_default()
            .push(produced);
        state.completed.push(Completed {
            node: node.clone(),
            args,
            outcome: Outcome::Succeeded(outputs.clone()),
        });
    }

    fn record_isolated(&self, state: &mut RunState, node: &TaskNode, args: TaskArgs, e: &TaskError) {
        let mut produced = Values::new();
        for name in node.task().provides() {
            state
                .values
                .insert(node.target_of(name).to_string(), Value::Null);
            produced.insert(name.to_string(), Value::Null);
        }
        state
            .history
            .entry(node.name().to_string())
            .or_default()
            .push(produced);
        state.completed.push(Completed {
            node: node.clone(),
            args,
            outcome: Outcome::Failed(e.to_string()),
        });
    }

    /// Revert completed tasks, newest first. Revert failures do not stop it.
    async fn rollback(&self, state: &mut RunState) {
        let execution_id = state.id();
        let flow_name = state.execution.flow_name.clone();

        if state.completed.is_empty() {
            let message = state.execution.error.clone().unwrap_or_default();
            state
                .emit(
                    FlowEvent::new(
                        execution_id,
                        None,
                        FlowEventType::FlowFailed,
                        format!("{}:complete", execution_id),
                        format!("Flow '{}' failed before any task completed", flow_name),
                        TaskState::Failed,
                    )
                    .with_error(message),
                )
                .await;
            return;
        }

        warn!(%execution_id, completed = state.completed.len(), "Reverting flow");
        state
            .emit(FlowEvent::new(
                execution_id,
                None,
                FlowEventType::FlowReverting,
                format!("{}:revert", execution_id),
                format!("Flow '{}' reverting", flow_name),
                TaskState::Running,
            ))
            .await;

        let completed = std::mem::take(&mut state.completed);
        for entry in completed.iter().rev() {
            let name = entry.node.name().to_string();
            let idem_key = format!("{}:{}:revert", execution_id, name);
            let started = Instant::now();

            let result = entry
                .node
                .task()
                .revert(&self.ctx, &entry.args, &entry.outcome)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let event = match result {
                Ok(()) => FlowEvent::new(
                    execution_id,
                    Some(name.clone()),
                    FlowEventType::TaskReverted,
                    idem_key,
                    format!("Task '{}' reverted", name),
                    TaskState::Reverted,
                )
                .with_duration(duration_ms),
                Err(e) => {
                    error!(task = %name, error = %e, "Revert failed, continuing rollback");
                    FlowEvent::new(
                        execution_id,
                        Some(name.clone()),
                        FlowEventType::TaskRevertFailed,
                        idem_key,
                        format!("Task '{}' revert failed: {}", name, e),
                        TaskState::RevertFailed,
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string())
                }
            };
            state.emit(event).await;
        }

        state
            .emit(FlowEvent::new(
                execution_id,
                None,
                FlowEventType::FlowReverted,
                format!("{}:complete", execution_id),
                format!("Flow '{}' reverted", flow_name),
                TaskState::Reverted,
            ))
            .await;
    }
}

/// Bind a node's arguments from injected values and the context.
fn resolve_args(node: &TaskNode, values: &Values) -> Result<TaskArgs, TaskError> {
    let task = node.task();
    let mut args = Values::new();

    for arg in task.requires() {
        let value = match node.injected().get(arg) {
            Some(value) => value.clone(),
            None => {
                let source = node.source_of(arg);
                values
                    .get(source)
                    .cloned()
                    .ok_or_else(|| TaskError::MissingInput(source.to_string()))?
            }
        };
        args.insert(arg.to_string(), value);
    }

    for arg in task.optional() {
        let value = node
            .injected()
            .get(arg)
            .or_else(|| values.get(node.source_of(arg)));
        if let Some(value) = value {
            args.insert(arg.to_string(), value.clone());
        }
    }

    for (arg, value) in node.injected() {
        args.entry(arg.clone()).or_insert_with(|| value.clone());
    }

    Ok(TaskArgs::new(args))
}
