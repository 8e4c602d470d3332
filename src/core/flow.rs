//! Flow composition.
//!
//! A flow is an ordered list of nodes: task nodes, nested flows and branches.
//! Its `requires` are the names some node consumes before any earlier node
//! provides them; its `provides` are everything any node can produce.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::retry::RetryPolicy;
use super::task::{ErrorPolicy, Task, Values};

/// A task placed in a flow, with its wiring.
#[derive(Clone)]
pub struct TaskNode {
    name: String,
    task: Arc<dyn Task>,
    rebind: BTreeMap<String, String>,
    provides_as: BTreeMap<String, String>,
    inject: Values,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    policy: Option<ErrorPolicy>,
}

impl TaskNode {
    pub fn new(task: impl Task + 'static) -> Self {
        Self {
            name: task.name().to_string(),
            task: Arc::new(task),
            rebind: BTreeMap::new(),
            provides_as: BTreeMap::new(),
            inject: Values::new(),
            retry: None,
            timeout: None,
            policy: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Read argument `arg` from the context value `from`.
    pub fn rebind(mut self, arg: &str, from: &str) -> Self {
        self.rebind.insert(arg.to_string(), from.to_string());
        self
    }

    /// Store output `produced` under `as_name`.
    pub fn provides_as(mut self, produced: &str, as_name: &str) -> Self {
        self.provides_as
            .insert(produced.to_string(), as_name.to_string());
        self
    }

    /// Bind `arg` at composition time. Injected arguments are not requirements.
    pub fn inject(mut self, arg: &str, value: &impl Serialize) -> Self {
        self.inject.insert(
            arg.to_string(),
            serde_json::to_value(value).unwrap_or_default(),
        );
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.policy.unwrap_or_else(|| self.task.error_policy())
    }

    pub fn injected(&self) -> &Values {
        &self.inject
    }

    /// Context name an argument is read from.
    pub fn source_of<'a>(&'a self, arg: &'a str) -> &'a str {
        self.rebind.get(arg).map(String::as_str).unwrap_or(arg)
    }

    /// Context name an output is written to.
    pub fn target_of<'a>(&'a self, produced: &'a str) -> &'a str {
        self.provides_as
            .get(produced)
            .map(String::as_str)
            .unwrap_or(produced)
    }

    pub fn requires(&self) -> BTreeSet<String> {
        self.task
            .requires()
            .into_iter()
            .filter(|arg| !self.inject.contains_key(*arg))
            .map(|arg| self.source_of(arg).to_string())
            .collect()
    }

    pub fn provides(&self) -> BTreeSet<String> {
        self.task
            .provides()
            .into_iter()
            .map(|p| self.target_of(p).to_string())
            .collect()
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("task", &self.task.name())
            .finish()
    }
}

/// Chooses a branch arm from every result the watched node has produced
/// during the execution so far.
pub type Decider = Arc<dyn Fn(&[Values]) -> bool + Send + Sync>;

/// Runtime choice between two subflows.
#[derive(Clone)]
pub struct Branch {
    name: String,
    watch: String,
    decider: Decider,
    on_true: Flow,
    on_false: Flow,
}

impl Branch {
    pub fn new(
        name: impl Into<String>,
        watch: impl Into<String>,
        decider: impl Fn(&[Values]) -> bool + Send + Sync + 'static,
        on_true: Flow,
        on_false: Flow,
    ) -> Self {
        Self {
            name: name.into(),
            watch: watch.into(),
            decider: Arc::new(decider),
            on_true,
            on_false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watched(&self) -> &str {
        &self.watch
    }

    pub fn decide(&self, history: &[Values]) -> &Flow {
        if (self.decider)(history) {
            &self.on_true
        } else {
            &self.on_false
        }
    }

    pub fn arms(&self) -> [&Flow; 2] {
        [&self.on_true, &self.on_false]
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name)
            .field("watch", &self.watch)
            .field("on_true", &self.on_true.name)
            .field("on_false", &self.on_false.name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Task(TaskNode),
    Flow(Flow),
    Branch(Branch),
}

impl From<TaskNode> for Node {
    fn from(node: TaskNode) -> Self {
        Node::Task(node)
    }
}

impl From<Flow> for Node {
    fn from(flow: Flow) -> Self {
        Node::Flow(flow)
    }
}

impl From<Branch> for Node {
    fn from(branch: Branch) -> Self {
        Node::Branch(branch)
    }
}

/// Linear flow of nodes.
#[derive(Debug, Clone)]
pub struct Flow {
    name: String,
    nodes: Vec<Node>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Append a node (task node, subflow or branch).
    pub fn then(mut self, node: impl Into<Node>) -> Self {
        self.nodes.push(node.into());
        self
    }

    /// Append a task with default wiring.
    pub fn task(self, task: impl Task + 'static) -> Self {
        self.then(TaskNode::new(task))
    }

    pub fn push(&mut self, node: impl Into<Node>) {
        self.nodes.push(node.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn requires(&self) -> BTreeSet<String> {
        let mut produced = BTreeSet::new();
        let mut required = BTreeSet::new();
        self.collect(&mut produced, &mut required);
        required
    }

    pub fn provides(&self) -> BTreeSet<String> {
        let mut produced = BTreeSet::new();
        let mut required = BTreeSet::new();
        self.collect(&mut produced, &mut required);
        produced
    }

    fn collect(&self, produced: &mut BTreeSet<String>, required: &mut BTreeSet<String>) {
        for node in &self.nodes {
            match node {
                Node::Task(task) => {
                    for name in task.requires() {
                        if !produced.contains(&name) {
                            required.insert(name);
                        }
                    }
                    produced.extend(task.provides());
                }
                Node::Flow(flow) => flow.collect(produced, required),
                Node::Branch(branch) => {
                    let mut union = BTreeSet::new();
                    for arm in branch.arms() {
                        let mut arm_produced = produced.clone();
                        arm.collect(&mut arm_produced, required);
                        union.extend(arm_produced);
                    }
                    produced.extend(union);
                }
            }
        }
    }

    /// Nested flows at any depth whose name ends with `suffix`.
    pub fn count_subflows(&self, suffix: &str) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Flow(flow) => {
                    usize::from(flow.name.ends_with(suffix)) + flow.count_subflows(suffix)
                }
                Node::Branch(branch) => branch
                    .arms()
                    .iter()
                    .map(|arm| usize::from(arm.name.ends_with(suffix)) + arm.count_subflows(suffix))
                    .sum(),
                Node::Task(_) => 0,
            })
            .sum()
    }

    /// Every task node name, including both arms of branches.
    pub fn task_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(0, &mut |_, line| {
            if let Line::Task(name) = line {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Indented tree, one line per node.
    pub fn outline(&self) -> Vec<String> {
        let mut lines = vec![format!("{} (flow)", self.name)];
        self.walk(1, &mut |depth, line| {
            let indent = "  ".repeat(depth);
            lines.push(match line {
                Line::Task(name) => format!("{}{}", indent, name),
                Line::Flow(name) => format!("{}{} (flow)", indent, name),
                Line::Branch(name, watch) => {
                    format!("{}{} (branch on {})", indent, name, watch)
                }
            });
        });
        lines
    }

    fn walk<'a>(&'a self, depth: usize, visit: &mut dyn FnMut(usize, Line<'a>)) {
        for node in &self.nodes {
            match node {
                Node::Task(task) => visit(depth, Line::Task(&task.name)),
                Node::Flow(flow) => {
                    visit(depth, Line::Flow(&flow.name));
                    flow.walk(depth + 1, visit);
                }
                Node::Branch(branch) => {
                    visit(depth, Line::Branch(&branch.name, &branch.watch));
                    for arm in branch.arms() {
                        visit(depth + 1, Line::Flow(&arm.name));
                        arm.walk(depth + 2, visit);
                    }
                }
            }
        }
    }
}

enum Line<'a> {
    Task(&'a str),
    Flow(&'a str),
    Branch(&'a str, &'a str),
}

/// True when the watched node has ever produced a non-null `name`.
pub fn produced_value(history: &[Values], name: &str) -> bool {
    history
        .iter()
        .any(|outputs| outputs.get(name).map_or(false, |v| !v.is_null()))
}

/// Convenience for tests and callers assembling inputs.
pub fn values<I, K>(pairs: I) -> Values
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::task::{TaskArgs, TaskContext, TaskError, TaskOutputs};

    struct Stub {
        name: &'static str,
        requires: Vec<&'static str>,
        provides: Vec<&'static str>,
    }

    fn stub(name: &'static str, requires: &[&'static str], provides: &[&'static str]) -> Stub {
        Stub {
            name,
            requires: requires.to_vec(),
            provides: provides.to_vec(),
        }
    }

    #[async_trait]
    impl Task for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn requires(&self) -> Vec<&'static str> {
            self.requires.clone()
        }
        fn provides(&self) -> Vec<&'static str> {
            self.provides.clone()
        }
        async fn execute(&self, _: &TaskContext, _: &TaskArgs) -> Result<TaskOutputs, TaskError> {
            Ok(TaskOutputs::none())
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_requires_excludes_earlier_provides() {
        let flow = Flow::new("f")
            .task(stub("a", &["x"], &["y"]))
            .task(stub("b", &["y", "z"], &["w"]));

        assert_eq!(flow.requires(), set(&["x", "z"]));
        assert_eq!(flow.provides(), set(&["y", "w"]));
    }

    #[test]
    fn test_late_provider_does_not_cancel_requirement() {
        let flow = Flow::new("f")
            .task(stub("a", &["y"], &[]))
            .task(stub("b", &[], &["y"]));
        assert_eq!(flow.requires(), set(&["y"]));
    }

    #[test]
    fn test_inject_rebind_and_rename() {
        let node = TaskNode::new(stub("a", &["amphora", "port"], &["delta"]))
            .inject("amphora", &json!({"id": "amp-1"}))
            .rebind("port", "base_port")
            .provides_as("delta", "first_delta");
        let flow = Flow::new("f").then(node);

        assert_eq!(flow.requires(), set(&["base_port"]));
        assert_eq!(flow.provides(), set(&["first_delta"]));
    }

    #[test]
    fn test_branch_unions_both_arms() {
        let flow = Flow::new("f")
            .task(stub("map", &["lb"], &["amp_id"]))
            .then(Branch::new(
                "decide",
                "map",
                |h| produced_value(h, "amp_id"),
                Flow::new("reuse").task(stub("reload", &["amp_id"], &["amp"])),
                Flow::new("create").task(stub("boot", &["flavor"], &["amp", "compute"])),
            ));

        assert_eq!(flow.requires(), set(&["lb", "flavor"]));
        assert_eq!(flow.provides(), set(&["amp_id", "amp", "compute"]));
        assert_eq!(flow.count_subflows("create"), 1);
        assert_eq!(flow.task_names(), vec!["map", "reload", "boot"]);
    }

    #[test]
    fn test_nested_flow_and_outline() {
        let inner = Flow::new("inner").task(stub("b", &["x"], &["y"]));
        let flow = Flow::new("outer")
            .task(stub("a", &[], &["x"]))
            .then(inner)
            .task(stub("c", &["y"], &[]));

        assert!(flow.requires().is_empty());
        assert_eq!(flow.count_subflows("inner"), 1);
        assert_eq!(
            flow.outline(),
            vec!["outer (flow)", "  a", "  inner (flow)", "    b", "  c"]
        );
    }

    #[test]
    fn test_produced_value_decider() {
        let none = values([("amphora_id", Value::Null)]);
        let some = values([("amphora_id", json!("amp-1"))]);
        assert!(!produced_value(&[], "amphora_id"));
        assert!(!produced_value(&[none.clone()], "amphora_id"));
        assert!(produced_value(&[none, some], "amphora_id"));
    }
}
