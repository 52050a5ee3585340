use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use camino::Utf8Path;
use console::style;
use tracing::{info, warn};

use crate::config::Options;
use crate::core::{Layout, Node};
use crate::engine::runner::{BatchSummary, Progress, run_batch};
use crate::engine::{Engine, ManualDep, Signature};
use crate::env::Environment;
use crate::error::{BuildError, ConfigError, KilnError, SignatureError, TaskFailure};
use crate::sched::TaskManager;
use crate::task::{AttrKey, AttrValue, Registry, Task, TaskId, TaskKind, TaskState};

/// What a successful run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    pub executed: usize,
    pub skipped: usize,
    pub restored: usize,
}

impl BuildReport {
    fn add(&mut self, summary: &BatchSummary) {
        self.executed += summary.executed;
        self.skipped += summary.skipped;
        self.restored += summary.restored;
    }
}

/// A project: registered kinds, declared tasks and the state needed to
/// bring them up to date.
///
/// ```no_run
/// use kiln::{Build, Options, TaskKind};
///
/// let mut build = Build::new(Options::new("/project", "/project/build"));
/// let cc = TaskKind::command("cc", "${CC} -c ${SRC} -o ${TGT}")?
///     .ext_in([".c"])
///     .ext_out([".o"])
///     .build();
/// build.register(cc)?;
/// build.task("cc")?.source("main.c").target("main.o").id();
/// build.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Build {
    registry: Registry,
    manager: TaskManager,
    engine: Engine,
    env: Arc<Environment>,
    states: Vec<OnceLock<TaskState>>,
}

impl Build {
    pub fn new(options: Options) -> Self {
        Self {
            registry: Registry::new(),
            manager: TaskManager::new(options.policy),
            engine: Engine::new(options),
            env: Arc::new(Environment::new()),
            states: Vec::new(),
        }
    }

    pub fn register(&mut self, kind: TaskKind) -> Result<Arc<TaskKind>, ConfigError> {
        self.registry.register(kind)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn layout(&self) -> &Layout {
        &self.engine.options().layout
    }

    pub fn options(&self) -> &Options {
        self.engine.options()
    }

    /// Environment given to tasks created from now on.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn set_env(&mut self, env: Environment) {
        self.env = Arc::new(env);
    }

    pub fn add_group(&mut self, name: Option<&str>) -> usize {
        self.manager.add_group(name)
    }

    pub fn set_group(&mut self, name: &str) -> Result<(), ConfigError> {
        self.manager.set_group(name)
    }

    /// Starts declaring a task of a registered kind in the current group.
    pub fn task(&mut self, kind: &str) -> Result<TaskBuilder<'_>, ConfigError> {
        let kind = self.registry.get(kind)?;
        let id = self.manager.add_task(kind, self.env.clone());
        Ok(TaskBuilder { build: self, id })
    }

    /// Makes every task reading or writing `node` also depend on `dep`.
    pub fn add_manual_dependency(&mut self, node: Node, dep: ManualDep) {
        self.engine.manual_deps.entry(node).or_default().push(dep);
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn task_by_id(&self, id: TaskId) -> &Task {
        self.manager.task(id)
    }

    /// Outcome of a task in the last run.
    pub fn state(&self, id: TaskId) -> TaskState {
        self.states
            .get(id.index())
            .and_then(OnceLock::get)
            .cloned()
            .unwrap_or_default()
    }

    /// Signature of a task as of the last run, computing it if needed.
    pub fn signature_of(&self, id: TaskId) -> Result<Signature, SignatureError> {
        self.engine.signature(self.manager.task(id))
    }

    /// Nodes and unresolved names found by the last scan of a task.
    pub fn scan_result(&self, id: TaskId) -> Option<(Vec<Node>, Vec<String>)> {
        self.engine.scan_result(self.manager.task(id))
    }

    /// Brings every task up to date.
    ///
    /// Batches are run one after another; without `keep_going` the build
    /// stops after the first batch with a failure. The signature store is
    /// saved in every case.
    pub fn run(&mut self) -> Result<BuildReport, KilnError> {
        let start = Instant::now();
        let variants: BTreeSet<String> = self.manager.tasks().iter().map(Task::variant).collect();
        self.engine.begin(variants.iter().map(String::as_str));

        for task in &mut self.manager.tasks {
            task.signature = OnceLock::new();
        }
        self.states = (0..self.manager.tasks().len())
            .map(|_| OnceLock::new())
            .collect();
        self.manager.reset();

        let progress = Progress::new(self.manager.tasks().len());
        let mut report = BuildReport::default();
        let mut failed = false;

        let outcome = loop {
            let batch = match self.manager.get_next_set() {
                Ok(Some(batch)) => batch,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };

            let summary = run_batch(
                &self.engine,
                self.manager.tasks(),
                &batch,
                &self.states,
                &progress,
            );
            report.add(&summary);

            if summary.failed > 0 || summary.stuck > 0 {
                failed = true;
                if !self.engine.options().keep_going {
                    break Ok(());
                }
            }
        };

        if let Err(err) = self.engine.save() {
            warn!("{err}");
        }
        outcome?;

        if failed {
            return Err(self.failure().into());
        }

        info!(
            "{} in {:.2}s: {} executed, {} up to date, {} restored",
            style("Build finished").green(),
            start.elapsed().as_secs_f32(),
            report.executed,
            report.skipped,
            report.restored,
        );
        Ok(report)
    }

    fn failure(&self) -> BuildError {
        let mut error = BuildError::default();
        for task in self.manager.tasks() {
            match self.states[task.id().index()].get() {
                Some(state) if state.is_failure() => error.failures.push(TaskFailure {
                    task: task.to_string(),
                    state: state.clone(),
                }),
                Some(_) => {}
                None => error.unstarted.push(task.to_string()),
            }
        }
        error
    }
}

/// Declares the inputs, outputs and attributes of a new task.
pub struct TaskBuilder<'b> {
    build: &'b mut Build,
    id: TaskId,
}

impl TaskBuilder<'_> {
    fn task(&mut self) -> &mut Task {
        self.build.manager.task_mut(self.id)
    }

    /// Input relative to the source root.
    pub fn source(mut self, path: impl AsRef<Utf8Path>) -> Self {
        let node = self.build.layout().src(path);
        self.task().inputs.push(node);
        self
    }

    pub fn sources<P: AsRef<Utf8Path>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        for path in paths {
            self = self.source(path);
        }
        self
    }

    /// Output relative to the variant directory of the task's environment.
    pub fn target(mut self, path: impl AsRef<Utf8Path>) -> Self {
        let variant = self.task().variant();
        let node = self.build.layout().out(&variant, path);
        self.task().outputs.push(node);
        self
    }

    pub fn targets<P: AsRef<Utf8Path>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        for path in paths {
            self = self.target(path);
        }
        self
    }

    pub fn input(mut self, node: Node) -> Self {
        self.task().inputs.push(node);
        self
    }

    pub fn output(mut self, node: Node) -> Self {
        self.task().outputs.push(node);
        self
    }

    /// Replaces the task's environment. Call before `target` so outputs
    /// land in the right variant directory.
    pub fn env(mut self, env: Environment) -> Self {
        self.task().env = Arc::new(env);
        self
    }

    /// Must not start before `other` has completed.
    pub fn after_task(mut self, other: TaskId) -> Self {
        self.task().run_after.insert(other);
        self
    }

    /// Overrides a kind attribute for this task only.
    pub fn set(mut self, key: AttrKey, value: AttrValue) -> Self {
        self.task().overrides.insert(key, value);
        self
    }

    /// Extra environment variables feeding this task's signature.
    pub fn dep_vars<S: Into<String>>(mut self, vars: impl IntoIterator<Item = S>) -> Self {
        self.task().dep_vars.extend(vars.into_iter().map(Into::into));
        self
    }

    /// Extra node feeding this task's explicit signature.
    pub fn dep_node(mut self, node: Node) -> Self {
        self.task().dep_nodes.push(node);
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.task().cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn id(self) -> TaskId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::Dispatch;

    fn project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn options(root: &Utf8Path) -> Options {
        Options::new(root, root.join("build")).cache_dir(None::<Utf8PathBuf>)
    }

    #[test]
    fn test_builder_places_nodes() {
        let (_dir, root) = project();
        let mut build = Build::new(options(&root));
        build
            .register(TaskKind::func("copy", "copy", |_| Ok(())).build())
            .unwrap();

        let mut debug = build.env().derive();
        debug.set("VARIANT", "debug");
        let id = build
            .task("copy")
            .unwrap()
            .env(debug)
            .source("a.txt")
            .target("a.out")
            .id();

        let task = build.task_by_id(id);
        assert_eq!(task.inputs()[0].path(), root.join("a.txt"));
        assert_eq!(task.outputs()[0].path(), root.join("build/debug/a.out"));
        assert_eq!(task.outputs()[0].variant(), Some("debug"));
        assert!(matches!(build.task("nope"), Err(ConfigError::UnknownKind(_))));
    }

    #[test]
    fn test_func_tasks_and_failures() {
        let (_dir, root) = project();
        fs::write(root.join("in.txt"), "data").unwrap();

        let mut build = Build::new(options(&root).policy(Dispatch::FullyParallel));
        build
            .register(
                TaskKind::func("copy", "copy", |cx| {
                    let data = fs::read(cx.inputs()[0].path())?;
                    fs::write(cx.outputs()[0].path(), data)?;
                    Ok(())
                })
                .build(),
            )
            .unwrap();
        build
            .register(TaskKind::func("boom", "boom", |_| panic!("kaboom")).build())
            .unwrap();

        let ok = build.task("copy").unwrap().source("in.txt").target("out.txt").id();
        let bad = build.task("boom").unwrap().target("never").id();
        let blocked = build
            .task("copy")
            .unwrap()
            .source("in.txt")
            .target("later.txt")
            .after_task(bad)
            .id();

        let err = match build.run() {
            Err(KilnError::Build(err)) => err,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert_eq!(build.state(ok), TaskState::Success);
        assert!(matches!(build.state(bad), TaskState::Exception(msg) if msg.contains("kaboom")));
        assert_eq!(build.state(blocked), TaskState::NotRun);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.unstarted.len(), 1);
        assert!(root.join("build/default/out.txt").is_file());
    }
}
