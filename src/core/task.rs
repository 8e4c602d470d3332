//! The task primitive: a named unit of work with declared inputs and outputs,
//! an optional compensating revert, and an error policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::adapters::{AdapterError, AgentClient, CertIssuer, ComputeAdapter, NetworkAdapter};
use crate::config::ControllerConfig;
use crate::store::{Repository, StoreError};

/// Named values flowing between tasks.
pub type Values = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode output: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Transient collaborator failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_transient(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

/// What happens when a task's execute fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail the flow and roll back.
    Propagate,
    /// Mark the affected entity, null the outputs and keep going.
    IsolateAndContinue,
}

/// Collaborators and settings shared by every task of an engine.
#[derive(Clone)]
pub struct TaskContext {
    pub compute: Arc<dyn ComputeAdapter>,
    pub network: Arc<dyn NetworkAdapter>,
    pub agent: Arc<dyn AgentClient>,
    pub certs: Arc<dyn CertIssuer>,
    pub repo: Arc<dyn Repository>,
    pub config: Arc<ControllerConfig>,
}

/// Resolved arguments of one task invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    values: Values,
}

impl TaskArgs {
    pub fn new(values: Values) -> Self {
        Self { values }
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Required argument. `null` decodes fine into an `Option`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| TaskError::MissingInput(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| TaskError::InvalidInput {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Optional argument; absent and `null` are both `None`.
    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    /// Stable text form, used for idempotency keys.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_default()
    }
}

/// Named outputs of one successful execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutputs(Values);

impl TaskOutputs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(name: &str, value: &impl Serialize) -> Result<Self, TaskError> {
        Self::none().with(name, value)
    }

    pub fn with(mut self, name: &str, value: &impl Serialize) -> Result<Self, TaskError> {
        self.0.insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.0
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn into_values(self) -> Values {
        self.0
    }
}

/// What a revert is told about its own execute.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded(TaskOutputs),
    /// Execute failed (and was isolated); the revert must not act.
    Failed(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn output<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        match self {
            Self::Succeeded(outputs) => outputs.decode(name),
            Self::Failed(_) => None,
        }
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Arguments that must be bound before execute.
    fn requires(&self) -> Vec<&'static str>;

    /// Arguments passed when available.
    fn optional(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn provides(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::Propagate
    }

    async fn execute(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError>;

    /// Undo execute. Called at most once, during rollback.
    async fn revert(
        &self,
        _ctx: &TaskContext,
        _args: &TaskArgs,
        _outcome: &Outcome,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called when execute failed under `IsolateAndContinue`.
    async fn on_isolated_failure(&self, _ctx: &TaskContext, _args: &TaskArgs, _error: &TaskError) {}
}
