//! Engine Integration Tests
//!
//! Runs flows of scripted tasks through the engine and checks ordering,
//! retries, isolation, rollback and branch selection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use ampctl::adapters::{AdapterError, NoopDrivers};
use ampctl::core::flow::values;
use ampctl::core::{
    list_executions, produced_value, Branch, ErrorPolicy, Flow, FlowEngine, FlowError,
    FlowJournal, Outcome, RetryPolicy, Task, TaskArgs, TaskContext, TaskError, TaskNode,
    TaskOutputs, Values,
};
use ampctl::domain::{FlowState, TaskState};
use ampctl::{ControllerConfig, MemoryStore};

/// Shared log of what the scripted tasks did, in order.
#[derive(Clone, Default)]
struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    fn executed(&self) -> Vec<String> {
        self.with_prefix("execute ")
    }

    fn reverted(&self) -> Vec<String> {
        self.with_prefix("revert ")
    }

    fn arg(&self, task: &str, arg: &str) -> Option<String> {
        self.with_prefix(&format!("arg {}.{}=", task, arg))
            .into_iter()
            .next()
    }
}

enum Behavior {
    Succeed,
    ProduceNull,
    Fail(AdapterError),
    FailFirst(u32, AdapterError),
    Hang,
}

struct Scripted {
    name: &'static str,
    requires: Vec<&'static str>,
    provides: Vec<&'static str>,
    behavior: Behavior,
    policy: ErrorPolicy,
    revert_fails: bool,
    attempts: AtomicU32,
    trace: Trace,
}

impl Scripted {
    fn new(trace: &Trace, name: &'static str) -> Self {
        Self {
            name,
            requires: Vec::new(),
            provides: Vec::new(),
            behavior: Behavior::Succeed,
            policy: ErrorPolicy::Propagate,
            revert_fails: false,
            attempts: AtomicU32::new(0),
            trace: trace.clone(),
        }
    }

    fn requires(mut self, names: &[&'static str]) -> Self {
        self.requires = names.to_vec();
        self
    }

    fn provides(mut self, names: &[&'static str]) -> Self {
        self.provides = names.to_vec();
        self
    }

    fn behave(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn isolating(mut self) -> Self {
        self.policy = ErrorPolicy::IsolateAndContinue;
        self
    }

    fn revert_fails(mut self) -> Self {
        self.revert_fails = true;
        self
    }
}

#[async_trait]
impl Task for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn requires(&self) -> Vec<&'static str> {
        self.requires.clone()
    }

    fn provides(&self) -> Vec<&'static str> {
        self.provides.clone()
    }

    fn error_policy(&self) -> ErrorPolicy {
        self.policy
    }

    async fn execute(&self, _ctx: &TaskContext, args: &TaskArgs) -> Result<TaskOutputs, TaskError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.trace.push(format!("execute {}", self.name));
        for arg in &self.requires {
            let value = args.raw(arg).cloned().unwrap_or(Value::Null);
            self.trace.push(format!("arg {}.{}={}", self.name, arg, value));
        }

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::ProduceNull => {
                let mut outputs = TaskOutputs::none();
                for name in &self.provides {
                    outputs = outputs.with(name, &Value::Null)?;
                }
                return Ok(outputs);
            }
            Behavior::Fail(e) => return Err(e.clone().into()),
            Behavior::FailFirst(times, e) if attempt <= *times => return Err(e.clone().into()),
            Behavior::FailFirst(..) => {}
            Behavior::Hang => tokio::time::sleep(Duration::from_secs(30)).await,
        }

        let mut outputs = TaskOutputs::none();
        for name in &self.provides {
            outputs = outputs.with(name, &format!("{}:{}", self.name, name))?;
        }
        Ok(outputs)
    }

    async fn revert(
        &self,
        _ctx: &TaskContext,
        _args: &TaskArgs,
        outcome: &Outcome,
    ) -> Result<(), TaskError> {
        if outcome.is_failure() {
            self.trace.push(format!("revert {} (skipped)", self.name));
            return Ok(());
        }
        self.trace.push(format!("revert {}", self.name));
        if self.revert_fails {
            return Err(TaskError::Failed(format!("{} cannot be undone", self.name)));
        }
        Ok(())
    }
}

fn engine() -> FlowEngine {
    let drivers = NoopDrivers::new();
    FlowEngine::new(drivers.context(
        Arc::new(MemoryStore::new()),
        Arc::new(ControllerConfig::default()),
    ))
}

fn rejected() -> AdapterError {
    AdapterError::Rejected("nope".to_string())
}

fn refused() -> AdapterError {
    AdapterError::Connection("refused".to_string())
}

#[tokio::test]
async fn test_all_tasks_succeed() {
    let trace = Trace::default();
    let flow = Flow::new("happy")
        .task(Scripted::new(&trace, "a").provides(&["x"]))
        .task(Scripted::new(&trace, "b").requires(&["x"]).provides(&["y"]))
        .task(Scripted::new(&trace, "c").requires(&["x", "y"]));

    let execution = engine().run(&flow, Values::new()).await.unwrap();

    assert_eq!(execution.state, FlowState::Succeeded);
    assert_eq!(execution.executions, 3);
    assert!(execution.reverted.is_empty());
    assert_eq!(execution.completed, vec!["a", "b", "c"]);
    assert_eq!(trace.arg("c", "y").as_deref(), Some("\"b:y\""));
    assert_eq!(execution.value::<String>("x").as_deref(), Some("a:x"));
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn test_failure_reverts_completed_tasks_in_reverse() {
    let trace = Trace::default();
    let flow = Flow::new("doomed")
        .task(Scripted::new(&trace, "a"))
        .then(
            Flow::new("inner")
                .task(Scripted::new(&trace, "b"))
                .task(Scripted::new(&trace, "c")),
        )
        .task(Scripted::new(&trace, "d").behave(Behavior::Fail(rejected())))
        .task(Scripted::new(&trace, "e"));

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    let FlowError::TaskFailed { task, source, .. } = &err else {
        panic!("expected a task failure, got {:?}", err);
    };
    assert_eq!(task, "d");
    assert!(matches!(source, TaskError::Adapter(AdapterError::Rejected(_))));

    assert_eq!(trace.executed(), vec!["a", "b", "c", "d"]);
    assert_eq!(trace.reverted(), vec!["c", "b", "a"]);

    let execution = err.execution().unwrap();
    assert_eq!(execution.state, FlowState::Reverted);
    assert_eq!(execution.reverted, vec!["c", "b", "a"]);
    assert_eq!(execution.task_state("d"), TaskState::Failed);
    assert_eq!(execution.task_state("e"), TaskState::Pending);
}

#[tokio::test]
async fn test_failure_of_first_task_leaves_nothing_to_revert() {
    let trace = Trace::default();
    let flow = Flow::new("early")
        .task(Scripted::new(&trace, "a").behave(Behavior::Fail(rejected())))
        .task(Scripted::new(&trace, "b"));

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert!(trace.reverted().is_empty());
    let execution = err.execution().unwrap();
    assert_eq!(execution.state, FlowState::Failed);
    assert!(execution.error.is_some());
}

#[tokio::test]
async fn test_missing_inputs_run_nothing() {
    let trace = Trace::default();
    let flow = Flow::new("needy")
        .task(Scripted::new(&trace, "a").requires(&["loadbalancer_id"]))
        .task(Scripted::new(&trace, "b").requires(&["flavor"]));

    let err = engine()
        .run(&flow, values([("flavor", json!({}))]))
        .await
        .unwrap_err();

    match err {
        FlowError::MissingInputs { flow, missing } => {
            assert_eq!(flow, "needy");
            assert_eq!(missing, vec!["loadbalancer_id"]);
        }
        other => panic!("expected missing inputs, got {:?}", other),
    }
    assert!(trace.executed().is_empty());
}

#[tokio::test]
async fn test_null_input_is_present() {
    let trace = Trace::default();
    let flow = Flow::new("spare").task(Scripted::new(&trace, "a").requires(&["loadbalancer_id"]));

    engine()
        .run(&flow, values([("loadbalancer_id", Value::Null)]))
        .await
        .unwrap();

    assert_eq!(trace.arg("a", "loadbalancer_id").as_deref(), Some("null"));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let trace = Trace::default();
    let flow = Flow::new("flaky").then(
        TaskNode::new(Scripted::new(&trace, "plug").behave(Behavior::FailFirst(2, refused())))
            .retry(RetryPolicy::fixed(3, Duration::ZERO)),
    );

    let execution = engine().run(&flow, Values::new()).await.unwrap();

    assert_eq!(trace.executed().len(), 3);
    assert_eq!(execution.executions, 3);
    assert_eq!(execution.task_state("plug"), TaskState::Succeeded);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let trace = Trace::default();
    let flow = Flow::new("dead").then(
        TaskNode::new(Scripted::new(&trace, "plug").behave(Behavior::Fail(refused())))
            .retry(RetryPolicy::fixed(2, Duration::ZERO)),
    );

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert_eq!(trace.executed().len(), 2);
    assert!(err.task_error().unwrap().is_retryable());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let trace = Trace::default();
    let flow = Flow::new("rejected").then(
        TaskNode::new(Scripted::new(&trace, "plug").behave(Behavior::Fail(rejected())))
            .retry(RetryPolicy::fixed(5, Duration::ZERO)),
    );

    engine().run(&flow, Values::new()).await.unwrap_err();

    assert_eq!(trace.executed().len(), 1);
}

#[tokio::test]
async fn test_node_timeout() {
    let trace = Trace::default();
    let flow = Flow::new("slow").then(
        TaskNode::new(Scripted::new(&trace, "wait").behave(Behavior::Hang))
            .timeout(Duration::from_millis(20)),
    );

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert!(matches!(err.task_error(), Some(TaskError::Timeout(_))));
}

#[tokio::test]
async fn test_isolated_failure_nulls_outputs_and_continues() {
    let trace = Trace::default();
    let flow = Flow::new("best-effort")
        .task(
            Scripted::new(&trace, "vrrp-interface")
                .provides(&["amp_vrrp_int"])
                .behave(Behavior::Fail(refused()))
                .isolating(),
        )
        .task(Scripted::new(&trace, "vrrp-update").requires(&["amp_vrrp_int"]));

    let execution = engine().run(&flow, Values::new()).await.unwrap();

    assert_eq!(execution.state, FlowState::Succeeded);
    assert_eq!(execution.isolated, vec!["vrrp-interface"]);
    assert_eq!(execution.task_state("vrrp-interface"), TaskState::Failed);
    assert_eq!(trace.arg("vrrp-update", "amp_vrrp_int").as_deref(), Some("null"));
    assert_eq!(execution.values.get("amp_vrrp_int"), Some(&Value::Null));
}

#[tokio::test]
async fn test_isolated_task_revert_sees_failure() {
    let trace = Trace::default();
    let flow = Flow::new("isolated-then-fatal")
        .task(Scripted::new(&trace, "a"))
        .task(Scripted::new(&trace, "b").behave(Behavior::Fail(rejected())).isolating())
        .task(Scripted::new(&trace, "c").behave(Behavior::Fail(rejected())));

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert_eq!(trace.reverted(), vec!["b (skipped)", "a"]);
    assert_eq!(err.execution().unwrap().state, FlowState::Reverted);
}

#[tokio::test]
async fn test_revert_error_does_not_stop_rollback() {
    let trace = Trace::default();
    let flow = Flow::new("messy")
        .task(Scripted::new(&trace, "a"))
        .task(Scripted::new(&trace, "b").revert_fails())
        .task(Scripted::new(&trace, "c").behave(Behavior::Fail(rejected())));

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert_eq!(trace.reverted(), vec!["b", "a"]);
    let FlowError::TaskFailed { task, execution, .. } = err else {
        panic!("expected a task failure");
    };
    assert_eq!(task, "c");
    assert_eq!(execution.revert_failures, vec!["b"]);
    assert_eq!(execution.task_state("b"), TaskState::RevertFailed);
    assert_eq!(execution.task_state("a"), TaskState::Reverted);
}

#[tokio::test]
async fn test_renamed_output_and_rebound_argument() {
    let trace = Trace::default();
    let flow = Flow::new("wiring")
        .then(
            TaskNode::new(Scripted::new(&trace, "first").provides(&["config"]))
                .provides_as("config", "first_config"),
        )
        .then(
            TaskNode::new(Scripted::new(&trace, "second").requires(&["config"]))
                .rebind("config", "first_config"),
        )
        .then(
            TaskNode::new(Scripted::new(&trace, "third").requires(&["config"]))
                .inject("config", &"fixed"),
        );

    assert!(flow.requires().is_empty());
    let execution = engine().run(&flow, Values::new()).await.unwrap();

    assert_eq!(trace.arg("second", "config").as_deref(), Some("\"first:config\""));
    assert_eq!(trace.arg("third", "config").as_deref(), Some("\"fixed\""));
    assert!(execution.values.get("config").is_none());
}

fn spare_or_create(trace: &Trace, map: Behavior) -> Flow {
    Flow::new("amp-for-lb")
        .task(Scripted::new(trace, "map").provides(&["amphora_id"]).behave(map))
        .then(Branch::new(
            "spare-or-create",
            "map",
            |history| produced_value(history, "amphora_id"),
            Flow::new("reuse").task(Scripted::new(trace, "reload").requires(&["amphora_id"])),
            Flow::new("create").task(Scripted::new(trace, "boot").provides(&["amphora_id"])),
        ))
}

#[tokio::test]
async fn test_branch_runs_exactly_one_arm() {
    let trace = Trace::default();
    let execution = engine()
        .run(&spare_or_create(&trace, Behavior::Succeed), Values::new())
        .await
        .unwrap();
    assert_eq!(trace.executed(), vec!["map", "reload"]);
    assert_eq!(execution.decisions, vec!["spare-or-create -> reuse"]);

    let trace = Trace::default();
    let execution = engine()
        .run(&spare_or_create(&trace, Behavior::ProduceNull), Values::new())
        .await
        .unwrap();
    assert_eq!(trace.executed(), vec!["map", "boot"]);
    assert_eq!(execution.decisions, vec!["spare-or-create -> create"]);
    assert_eq!(execution.value::<String>("amphora_id").as_deref(), Some("boot:amphora_id"));
}

#[tokio::test]
async fn test_input_left_unset_by_branch_fails_the_flow_with_its_error() {
    let trace = Trace::default();
    let flow = Flow::new("unset")
        .then(Branch::new(
            "maybe-x",
            "nothing",
            |_| false,
            Flow::new("produce").task(Scripted::new(&trace, "make-x").provides(&["x"])),
            Flow::new("skip"),
        ))
        .task(Scripted::new(&trace, "use-x").requires(&["x"]));
    assert!(flow.requires().is_empty());

    let err = engine().run(&flow, Values::new()).await.unwrap_err();

    assert!(matches!(err.task_error(), Some(TaskError::MissingInput(name)) if name == "x"));
    assert!(trace.executed().is_empty());
    let execution = err.execution().unwrap();
    assert_eq!(execution.state, FlowState::Failed);
    assert_eq!(execution.task_state("use-x"), TaskState::Failed);
    assert!(execution.error.as_deref().unwrap_or_default().contains('x'));
}

#[tokio::test]
async fn test_executions_are_journaled() {
    let temp = TempDir::new().unwrap();
    let engine = engine().with_journal_dir(temp.path());
    let trace = Trace::default();

    let ok = engine
        .run(&Flow::new("ok").task(Scripted::new(&trace, "a")), Values::new())
        .await
        .unwrap();
    let failed = engine
        .run(
            &Flow::new("bad")
                .task(Scripted::new(&trace, "a"))
                .task(Scripted::new(&trace, "b").behave(Behavior::Fail(rejected()))),
            Values::new(),
        )
        .await
        .unwrap_err();
    let failed_id = failed.execution().unwrap().id;

    let mut ids = list_executions(temp.path()).await.unwrap();
    ids.sort();
    let mut expected = vec![ok.id, failed_id];
    expected.sort();
    assert_eq!(ids, expected);

    let replayed = FlowJournal::open(temp.path(), failed_id)
        .await
        .unwrap()
        .execution()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed.flow_name, "bad");
    assert_eq!(replayed.state, FlowState::Reverted);
    assert_eq!(replayed.reverted, vec!["a"]);
}
