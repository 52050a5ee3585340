//! Task scheduling.
//!
//! The [`TaskManager`] owns every task of a build and an ordered list of
//! [`TaskGroup`]s. Groups are hard barriers: batches of a group are only
//! produced once the previous group has nothing left to hand out, and the
//! caller drains every batch before asking for the next one.

mod constraint;
mod group;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Dispatch;
use crate::core::ArcStr;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::task::{Task, TaskId, TaskKind};

pub use group::TaskGroup;

/// A set of tasks that may run concurrently, together with the concurrency
/// ceiling to apply (`None` means unbounded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub tasks: Vec<TaskId>,
    pub maxjobs: Option<usize>,
}

pub struct TaskManager {
    pub(crate) tasks: Vec<Task>,
    groups: Vec<TaskGroup>,
    names: HashMap<ArcStr, usize>,
    /// Group receiving newly created tasks.
    adding: usize,
    /// Group currently handing out batches.
    current: usize,
    policy: Dispatch,
}

impl TaskManager {
    pub fn new(policy: Dispatch) -> Self {
        Self {
            tasks: Vec::new(),
            groups: Vec::new(),
            names: HashMap::new(),
            adding: 0,
            current: 0,
            policy,
        }
    }

    pub fn policy(&self) -> Dispatch {
        self.policy
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    /// Appends a new group and makes it the target for new tasks. A name
    /// that already exists only switches to that group.
    pub fn add_group(&mut self, name: Option<&str>) -> usize {
        if let Some(name) = name
            && let Some(&index) = self.names.get(name)
        {
            self.adding = index;
            return index;
        }

        let index = self.groups.len();
        let name: Option<ArcStr> = name.map(Into::into);
        if let Some(name) = &name {
            self.names.insert(name.clone(), index);
        }
        self.groups.push(TaskGroup::new(name));
        self.adding = index;
        index
    }

    /// Makes an existing named group the target for new tasks.
    pub fn set_group(&mut self, name: &str) -> Result<(), ConfigError> {
        match self.names.get(name) {
            Some(&index) => {
                self.adding = index;
                Ok(())
            }
            None => Err(ConfigError::UnknownGroup(name.to_string())),
        }
    }

    pub(crate) fn add_task(&mut self, kind: Arc<TaskKind>, env: Arc<Environment>) -> TaskId {
        if self.groups.is_empty() {
            self.add_group(None);
        }

        let id = TaskId(self.tasks.len());
        self.tasks.push(Task::new(id, kind, env));
        self.groups[self.adding].tasks.push(id);
        id
    }

    /// Next batch of ready work, or `None` once every group is drained.
    ///
    /// Moving to the next group happens only when the current one has no
    /// batch left, so callers get a hard barrier between groups as long as
    /// they finish each batch before calling again.
    pub fn get_next_set(&mut self) -> Result<Option<Batch>, ConfigError> {
        while self.current < self.groups.len() {
            let group = &mut self.groups[self.current];
            if let Some(batch) = group.next_batch(&mut self.tasks, self.policy)?
                && !batch.tasks.is_empty()
            {
                return Ok(Some(batch));
            }
            self.current += 1;
        }
        Ok(None)
    }

    /// Rewinds to the first group, discarding every derived plan.
    pub fn reset(&mut self) {
        self.current = 0;
        for group in &mut self.groups {
            group.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(name: &str) -> Arc<TaskKind> {
        Arc::new(TaskKind::func(name, name, |_| Ok(())).build())
    }

    #[test]
    fn test_groups_are_barriers() {
        let env = Arc::new(Environment::new());
        let mut manager = TaskManager::new(Dispatch::Grouped);

        manager.add_group(Some("first"));
        let a = manager.add_task(kind("a"), env.clone());
        manager.add_group(Some("second"));
        let b = manager.add_task(kind("b"), env.clone());

        let first = manager.get_next_set().unwrap().unwrap();
        assert_eq!(first.tasks, vec![a]);
        let second = manager.get_next_set().unwrap().unwrap();
        assert_eq!(second.tasks, vec![b]);
        assert!(manager.get_next_set().unwrap().is_none());
        assert!(manager.get_next_set().unwrap().is_none());
    }

    #[test]
    fn test_set_group() {
        let env = Arc::new(Environment::new());
        let mut manager = TaskManager::new(Dispatch::Grouped);
        manager.add_group(Some("gen"));
        manager.add_group(Some("build"));
        manager.set_group("gen").unwrap();
        let id = manager.add_task(kind("a"), env);

        assert_eq!(manager.groups()[0].tasks(), &[id]);
        assert!(matches!(
            manager.set_group("nope"),
            Err(ConfigError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_empty_groups_are_skipped() {
        let env = Arc::new(Environment::new());
        let mut manager = TaskManager::new(Dispatch::FullyParallel);
        manager.add_group(None);
        manager.add_group(None);
        let id = manager.add_task(kind("a"), env);

        let batch = manager.get_next_set().unwrap().unwrap();
        assert_eq!(batch.tasks, vec![id]);
        assert!(manager.get_next_set().unwrap().is_none());
    }
}
