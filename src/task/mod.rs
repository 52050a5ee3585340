pub(crate) mod command;
mod kind;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{ArcStr, Hash32, Node};
use crate::engine::Signature;
use crate::env::Environment;

pub use command::CommandTemplate;
pub use kind::{AttrKey, AttrValue, KindBuilder, Registry, RunBehavior, RunFn, TaskKind};

/// Index of a task inside its [`crate::TaskManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Decision made for a task before it is handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    AskLater,
    RunMe,
    SkipMe,
}

/// Outcome of a task within one build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    NotRun,
    Skipped,
    Restored,
    Success,
    /// The command exited with a nonzero code.
    Crashed(i32),
    /// The run reported success but these declared outputs do not exist.
    Missing(Vec<Node>),
    /// The run raised an error, panicked, or its signature could not be
    /// computed.
    Exception(String),
}

impl TaskState {
    /// Whether dependants may proceed.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TaskState::Skipped | TaskState::Restored | TaskState::Success
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskState::Crashed(_) | TaskState::Missing(_) | TaskState::Exception(_)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::NotRun => write!(f, "not run"),
            TaskState::Skipped => write!(f, "up to date"),
            TaskState::Restored => write!(f, "restored from cache"),
            TaskState::Success => write!(f, "ok"),
            TaskState::Crashed(code) => write!(f, "failed with exit status {code}"),
            TaskState::Missing(nodes) => {
                let names: Vec<_> = nodes.iter().map(|n| n.path().as_str()).collect();
                write!(f, "missing outputs: {}", names.join(", "))
            }
            TaskState::Exception(msg) => write!(f, "raised an error: {msg}"),
        }
    }
}

/// One schedulable build step.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: Arc<TaskKind>,
    pub(crate) inputs: Vec<Node>,
    pub(crate) outputs: Vec<Node>,
    pub(crate) run_after: BTreeSet<TaskId>,
    pub(crate) env: Arc<Environment>,
    pub(crate) overrides: HashMap<AttrKey, AttrValue>,
    pub(crate) dep_vars: Vec<String>,
    pub(crate) dep_nodes: Vec<Node>,
    pub(crate) cwd: Option<Utf8PathBuf>,
    pub(crate) uid: OnceLock<Hash32>,
    pub(crate) signature: OnceLock<Signature>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: Arc<TaskKind>, env: Arc<Environment>) -> Self {
        Self {
            id,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            run_after: BTreeSet::new(),
            env,
            overrides: HashMap::new(),
            dep_vars: Vec::new(),
            dep_nodes: Vec::new(),
            cwd: None,
            uid: OnceLock::new(),
            signature: OnceLock::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Node] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Node] {
        &self.outputs
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn run_after(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.run_after.iter().copied()
    }

    pub fn cwd(&self) -> Option<&Utf8Path> {
        self.cwd.as_deref()
    }

    pub fn variant(&self) -> String {
        self.env.variant()
    }

    /// Instance override first, then the kind default.
    pub fn attr(&self, key: AttrKey) -> Option<&AttrValue> {
        self.overrides
            .get(&key)
            .or_else(|| self.kind.defaults.get(&key))
    }

    pub fn list(&self, key: AttrKey) -> &[ArcStr] {
        match self.attr(key) {
            Some(AttrValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn maxjobs(&self) -> Option<usize> {
        match self.attr(AttrKey::MaxJobs) {
            Some(AttrValue::Count(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn quiet(&self) -> bool {
        matches!(self.attr(AttrKey::Quiet), Some(AttrValue::Flag(true)))
    }

    /// Short human readable form, e.g. `cc: a.c -> a.o`.
    pub fn describe(&self) -> String {
        let names = |nodes: &[Node]| {
            nodes
                .iter()
                .map(|n| n.name())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let inputs = names(&self.inputs);
        let outputs = names(&self.outputs);

        match (inputs.is_empty(), outputs.is_empty()) {
            (true, true) => self.kind.name.to_string(),
            (false, true) => format!("{}: {}", self.kind.name, inputs),
            (true, false) => format!("{}: -> {}", self.kind.name, outputs),
            (false, false) => format!("{}: {} -> {}", self.kind.name, inputs, outputs),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("run_after", &self.run_after)
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// What an in-process run behavior gets to see.
pub struct TaskContext<'a> {
    pub task: &'a Task,
    pub env: &'a Environment,
}

impl TaskContext<'_> {
    pub fn inputs(&self) -> &[Node] {
        &self.task.inputs
    }

    pub fn outputs(&self) -> &[Node] {
        &self.task.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_of(kind: TaskKind) -> Task {
        Task::new(TaskId(0), Arc::new(kind), Arc::new(Environment::new()))
    }

    #[test]
    fn test_attr_override_precedence() {
        let mut task = task_of(
            TaskKind::func("cc", "cc", |_| Ok(()))
                .ext_in([".c"])
                .maxjobs(4)
                .build(),
        );

        assert_eq!(task.maxjobs(), Some(4));
        assert_eq!(task.list(AttrKey::ExtIn), &[ArcStr::from(".c")]);

        task.overrides
            .insert(AttrKey::MaxJobs, AttrValue::Count(1));
        task.overrides
            .insert(AttrKey::ExtIn, AttrValue::list([".cpp"]));

        assert_eq!(task.maxjobs(), Some(1));
        assert_eq!(task.list(AttrKey::ExtIn), &[ArcStr::from(".cpp")]);
        assert!(task.list(AttrKey::After).is_empty());
        assert!(!task.quiet());
    }

    #[test]
    fn test_describe() {
        let mut task = task_of(TaskKind::func("cc", "cc", |_| Ok(())).build());
        task.inputs.push(Node::source("/s/a.c"));
        task.outputs.push(Node::build("/b/default/a.o", "default"));
        assert_eq!(task.describe(), "cc: a.c -> a.o");
    }

    #[test]
    fn test_state_classification() {
        assert!(TaskState::Restored.is_completed());
        assert!(TaskState::Crashed(1).is_failure());
        assert!(!TaskState::NotRun.is_completed());
        assert!(!TaskState::NotRun.is_failure());
    }
}
