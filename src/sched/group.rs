use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::config::Dispatch;
use crate::core::{ArcStr, Hash32};
use crate::error::ConfigError;
use crate::sched::Batch;
use crate::sched::constraint::{Order, compare, constraint_key};
use crate::task::{Task, TaskId};

/// Tasks sharing one constraint key. Only the first task is used when
/// comparing against other buckets.
#[derive(Debug)]
struct Bucket {
    key: Hash32,
    tasks: Vec<TaskId>,
}

/// Partial order over the buckets of one group, consumed as batches are
/// handed out.
struct Plan {
    graph: DiGraph<Bucket, ()>,
    indegree: Vec<usize>,
    emitted: Vec<bool>,
    /// Ready tasks not yet handed out by the job-limited policy.
    pending: Vec<TaskId>,
    /// Set once the fully-parallel policy handed out the whole group.
    flattened: bool,
}

/// A set of tasks forming one scheduling barrier.
pub struct TaskGroup {
    pub(crate) name: Option<ArcStr>,
    pub(crate) tasks: Vec<TaskId>,
    plan: Option<Plan>,
}

impl TaskGroup {
    pub(crate) fn new(name: Option<ArcStr>) -> Self {
        Self {
            name,
            tasks: Vec::new(),
            plan: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    /// Derives the bucket graph. Fails if the graph has a cycle, before any
    /// task of the group is handed out.
    fn derive_plan(&self, tasks: &[Task]) -> Result<Plan, ConfigError> {
        let mut graph: DiGraph<Bucket, ()> = DiGraph::new();
        let mut index: HashMap<Hash32, NodeIndex> = HashMap::new();

        for &id in &self.tasks {
            let key = constraint_key(&tasks[id.0]);
            let node = *index.entry(key).or_insert_with(|| {
                graph.add_node(Bucket {
                    key,
                    tasks: Vec::new(),
                })
            });
            graph[node].tasks.push(id);
        }

        let buckets: Vec<NodeIndex> = graph.node_indices().collect();
        for (i, &a) in buckets.iter().enumerate() {
            for &b in &buckets[i + 1..] {
                let ta = &tasks[graph[a].tasks[0].0];
                let tb = &tasks[graph[b].tasks[0].0];
                match compare(ta, tb) {
                    Order::Before => {
                        graph.update_edge(a, b, ());
                    }
                    Order::After => {
                        graph.update_edge(b, a, ());
                    }
                    Order::Both => {
                        graph.update_edge(a, b, ());
                        graph.update_edge(b, a, ());
                    }
                    Order::Unrelated => {}
                }
            }
        }

        if petgraph::algo::toposort(&graph, None).is_err() {
            let stuck = petgraph::algo::tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .flatten()
                .map(|node| describe_bucket(&graph[node], tasks))
                .collect();
            return Err(ConfigError::CircularConstraint(stuck));
        }

        let indegree = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        debug!(
            buckets = graph.node_count(),
            edges = graph.edge_count(),
            "derived constraints for group {}",
            self.name.as_deref().unwrap_or("<anonymous>"),
        );

        Ok(Plan {
            emitted: vec![false; graph.node_count()],
            graph,
            indegree,
            pending: Vec::new(),
            flattened: false,
        })
    }

    /// Next batch of the group, or `None` once the group is drained.
    pub(crate) fn next_batch(
        &mut self,
        tasks: &mut [Task],
        policy: Dispatch,
    ) -> Result<Option<Batch>, ConfigError> {
        if self.tasks.is_empty() {
            return Ok(None);
        }

        if self.plan.is_none() {
            self.plan = Some(self.derive_plan(tasks)?);
        }
        let Some(plan) = self.plan.as_mut() else {
            return Ok(None);
        };

        match policy {
            Dispatch::Grouped => Ok(plan.next_layer().map(|tasks| Batch {
                tasks,
                maxjobs: None,
            })),
            Dispatch::FullyParallel => Ok(plan.flatten(tasks)),
            Dispatch::JobLimited => Ok(plan.next_limited(tasks)),
        }
    }

    /// Drops the derived plan. The next call to `next_batch` derives it anew.
    pub(crate) fn reset(&mut self) {
        self.plan = None;
    }
}

impl Plan {
    /// Emits every bucket with no pending predecessor.
    fn next_layer(&mut self) -> Option<Vec<TaskId>> {
        let ready: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| !self.emitted[n.index()] && self.indegree[n.index()] == 0)
            .collect();

        if ready.is_empty() {
            return None;
        }

        let mut batch = Vec::new();
        for node in ready {
            self.emitted[node.index()] = true;
            batch.extend_from_slice(&self.graph[node].tasks);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                self.indegree[next.index()] -= 1;
            }
        }
        Some(batch)
    }

    /// Copies every bucket edge onto the tasks as run-after links and hands
    /// out the whole group.
    fn flatten(&mut self, tasks: &mut [Task]) -> Option<Batch> {
        if self.flattened {
            return None;
        }
        self.flattened = true;

        for edge in self.graph.raw_edges() {
            let before = &self.graph[edge.source()].tasks;
            for &id in &self.graph[edge.target()].tasks {
                tasks[id.0].run_after.extend(before.iter().copied());
            }
        }

        let all = self
            .graph
            .node_indices()
            .flat_map(|n| self.graph[n].tasks.iter().copied())
            .collect();
        self.emitted.fill(true);

        Some(Batch {
            tasks: all,
            maxjobs: None,
        })
    }

    /// Splits each layer by concurrency ceiling: the tasks with the lowest
    /// ceiling go first, in their original order; the rest wait for the
    /// next call.
    fn next_limited(&mut self, tasks: &[Task]) -> Option<Batch> {
        if self.pending.is_empty() {
            self.pending = self.next_layer()?;
        }

        let ceiling = self
            .pending
            .iter()
            .filter_map(|id| tasks[id.0].maxjobs())
            .min();

        let (now, later): (Vec<TaskId>, Vec<TaskId>) = self
            .pending
            .iter()
            .partition(|id| tasks[id.0].maxjobs() == ceiling);
        self.pending = later;

        Some(Batch {
            tasks: now,
            maxjobs: ceiling,
        })
    }
}

fn describe_bucket(bucket: &Bucket, tasks: &[Task]) -> String {
    let first = &tasks[bucket.tasks[0].0];
    match bucket.tasks.len() {
        1 => format!("'{first}'"),
        n => format!("'{first}' and {} more [{}]", n - 1, bucket.key),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::env::Environment;
    use crate::task::{KindBuilder, TaskKind};

    fn noop(name: &str) -> KindBuilder {
        TaskKind::func(name, name, |_| Ok(()))
    }

    fn setup(kinds: Vec<TaskKind>, per_kind: usize) -> (Vec<Task>, TaskGroup) {
        let env = Arc::new(Environment::new());
        let mut tasks = Vec::new();
        let mut group = TaskGroup::new(None);
        for kind in kinds {
            let kind = Arc::new(kind);
            for _ in 0..per_kind {
                let id = TaskId(tasks.len());
                tasks.push(Task::new(id, kind.clone(), env.clone()));
                group.tasks.push(id);
            }
        }
        (tasks, group)
    }

    fn kinds_of(tasks: &[Task], batch: &Batch) -> Vec<String> {
        let mut kinds: Vec<String> = batch
            .tasks
            .iter()
            .map(|id| tasks[id.0].kind().name().to_string())
            .collect();
        kinds.dedup();
        kinds
    }

    #[test]
    fn test_grouped_layers_follow_extensions() {
        let (mut tasks, mut group) = setup(
            vec![
                noop("link").ext_in([".o"]).build(),
                noop("cc").ext_in([".c"]).ext_out([".o"]).build(),
            ],
            2,
        );

        let first = group.next_batch(&mut tasks, Dispatch::Grouped).unwrap().unwrap();
        assert_eq!(kinds_of(&tasks, &first), vec!["cc"]);
        assert_eq!(first.tasks.len(), 2);

        let second = group.next_batch(&mut tasks, Dispatch::Grouped).unwrap().unwrap();
        assert_eq!(kinds_of(&tasks, &second), vec!["link"]);

        assert!(group.next_batch(&mut tasks, Dispatch::Grouped).unwrap().is_none());
    }

    #[test]
    fn test_unrelated_buckets_share_a_batch() {
        let (mut tasks, mut group) = setup(vec![noop("a").build(), noop("b").build()], 1);
        let batch = group.next_batch(&mut tasks, Dispatch::Grouped).unwrap().unwrap();
        assert_eq!(batch.tasks.len(), 2);
    }

    #[test]
    fn test_cycle_is_fatal_and_names_buckets() {
        let (mut tasks, mut group) = setup(
            vec![
                noop("a").before(["b"]).build(),
                noop("b").before(["c"]).build(),
                noop("c").before(["a"]).build(),
                noop("free").build(),
            ],
            1,
        );

        let err = group.next_batch(&mut tasks, Dispatch::Grouped).unwrap_err();
        let ConfigError::CircularConstraint(names) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(names.len(), 3);
        assert!(!names.iter().any(|n| n.contains("free")));
        assert!(err.to_string().contains("circular order constraint"));
    }

    #[test]
    fn test_two_kinds_naming_each_other_first() {
        let (mut tasks, mut group) = setup(
            vec![noop("a").before(["b"]).build(), noop("b").before(["a"]).build()],
            1,
        );

        let err = group.next_batch(&mut tasks, Dispatch::Grouped).unwrap_err();
        let ConfigError::CircularConstraint(names) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_fully_parallel_flattens_edges() {
        let (mut tasks, mut group) = setup(
            vec![
                noop("cc").ext_out([".o"]).build(),
                noop("link").ext_in([".o"]).build(),
            ],
            1,
        );

        let batch = group
            .next_batch(&mut tasks, Dispatch::FullyParallel)
            .unwrap()
            .unwrap();
        assert_eq!(batch.tasks.len(), 2);
        assert_eq!(tasks[1].run_after().collect::<Vec<_>>(), vec![TaskId(0)]);
        assert!(tasks[0].run_after().next().is_none());

        assert!(
            group
                .next_batch(&mut tasks, Dispatch::FullyParallel)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_job_limited_lowest_ceiling_first() {
        let (mut tasks, mut group) = setup(
            vec![
                noop("free").build(),
                noop("serial").maxjobs(1).build(),
                noop("pair").maxjobs(2).build(),
            ],
            2,
        );

        let first = group
            .next_batch(&mut tasks, Dispatch::JobLimited)
            .unwrap()
            .unwrap();
        assert_eq!(first.maxjobs, Some(1));
        assert_eq!(kinds_of(&tasks, &first), vec!["serial"]);

        let second = group
            .next_batch(&mut tasks, Dispatch::JobLimited)
            .unwrap()
            .unwrap();
        assert_eq!(second.maxjobs, Some(2));
        assert_eq!(kinds_of(&tasks, &second), vec!["pair"]);

        let third = group
            .next_batch(&mut tasks, Dispatch::JobLimited)
            .unwrap()
            .unwrap();
        assert_eq!(third.maxjobs, None);
        assert_eq!(kinds_of(&tasks, &third), vec!["free"]);

        assert!(
            group
                .next_batch(&mut tasks, Dispatch::JobLimited)
                .unwrap()
                .is_none()
        );
    }
}
