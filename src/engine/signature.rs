//! Task identity and change detection.
//!
//! A task's composite signature combines three parts that are hashed and
//! stored separately, so that a rebuild can be explained:
//! - explicit: declared inputs, extra dep nodes and manual dependencies;
//! - implicit: whatever the kind's scanner discovered;
//! - env: the environment variables the kind declares relevant.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, enabled, warn};

use crate::core::{Blake3Hasher, Hash32, Node};
use crate::engine::{Engine, ManualDep};
use crate::error::{CacheError, SignatureError};
use crate::scan::ScanContext;
use crate::task::{AttrKey, RunStatus, Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub composite: Hash32,
    pub explicit: Hash32,
    pub implicit: Hash32,
    pub env: Hash32,
}

impl Signature {
    fn new(explicit: Hash32, implicit: Hash32, env: Hash32) -> Self {
        let composite = Blake3Hasher::new()
            .digest(&explicit)
            .digest(&implicit)
            .digest(&env)
            .finish32();
        Self {
            composite,
            explicit,
            implicit,
            env,
        }
    }
}

impl Task {
    /// Identity of the task, stable across runs and processes. Used as the
    /// key of everything stored about it.
    pub fn uid(&self) -> Hash32 {
        *self.uid.get_or_init(|| {
            let mut hasher = Blake3Hasher::new();
            hasher.field(&self.variant());
            hasher.raw(&(self.inputs.len() as u64).to_le_bytes());
            for node in self.inputs.iter().chain(&self.outputs) {
                hasher.field(node.path().as_str());
            }
            hasher.field(self.kind.name());
            hasher.field(self.kind.run().identity());
            hasher.finish32()
        })
    }

    /// Names of the environment variables feeding the env signature.
    pub fn vars(&self) -> Vec<&str> {
        self.list(AttrKey::Vars)
            .iter()
            .map(|var| &**var)
            .chain(self.dep_vars.iter().map(String::as_str))
            .collect()
    }
}

fn missing_marker(node: &Node) -> Hash32 {
    Blake3Hasher::new()
        .field("missing")
        .field(node.path().as_str())
        .finish32()
}

fn hash_deps(engine: &Engine, nodes: &[Node], names: &[String]) -> Hash32 {
    let mut hasher = Blake3Hasher::new();
    for node in nodes {
        let sig = engine.node_sig(node).unwrap_or_else(|| missing_marker(node));
        hasher.digest(&sig);
    }
    for name in names {
        hasher.field(name);
    }
    hasher.finish32()
}

impl Engine {
    /// Composite signature of a task, computed once per run.
    pub fn signature(&self, task: &Task) -> Result<Signature, SignatureError> {
        if let Some(sig) = task.signature.get() {
            return Ok(*sig);
        }

        let explicit = self.explicit_sig(task)?;
        let env = task.env().hash_vars(&task.vars());
        let implicit = self.implicit_sig(task, env)?;

        let sig = Signature::new(explicit, implicit, env);
        Ok(*task.signature.get_or_init(|| sig))
    }

    fn explicit_sig(&self, task: &Task) -> Result<Hash32, SignatureError> {
        let mut hasher = Blake3Hasher::new();

        for node in task.inputs().iter().chain(&task.dep_nodes) {
            let sig = self
                .node_sig(node)
                .ok_or_else(|| SignatureError::MissingInput(node.clone()))?;
            hasher.digest(&sig);
        }

        for node in task.inputs().iter().chain(task.outputs()) {
            let Some(deps) = self.manual_deps.get(node) else {
                continue;
            };
            for dep in deps {
                match dep {
                    ManualDep::Node(dep) => {
                        self.rescan(dep.parent());
                        let sig = self
                            .node_sig(dep)
                            .ok_or_else(|| SignatureError::MissingInput(dep.clone()))?;
                        hasher.digest(&sig);
                    }
                    ManualDep::Value(bytes) => {
                        hasher.raw(bytes);
                    }
                    ManualDep::Resolver(resolve) => {
                        hasher.raw(&resolve());
                    }
                }
            }
        }

        Ok(hasher.finish32())
    }

    /// Hash of the scanner's findings. The previous scan is reused when the
    /// nodes it found are unchanged and the environment, which may carry
    /// defines and include paths, is the same.
    fn implicit_sig(&self, task: &Task, env: Hash32) -> Result<Hash32, SignatureError> {
        let Some(scanner) = task.kind().scanner() else {
            return Ok(Hash32::default());
        };

        let variant = task.variant();
        let uid = task.uid();

        let previous = {
            let store = self.store();
            store.task_sig(&variant, &uid).zip(
                store
                    .deps(&variant, &uid)
                    .map(|(nodes, names)| (nodes.to_vec(), names.to_vec())),
            )
        };

        if let Some((prev, (nodes, names))) = previous
            && prev.env == env
        {
            let sig = hash_deps(self, &nodes, &names);
            if sig == prev.implicit {
                return Ok(sig);
            }
            debug!("{task}: dependencies changed, scanning again");
        }

        let cx = ScanContext {
            layout: &self.options.layout,
            cache: &self.parse_cache,
            max_files: self.options.max_include_files,
        };
        let result = scanner.scan(task, &cx)?;
        let sig = hash_deps(self, &result.nodes, &result.names);

        self.store_mut()
            .set_deps(&variant, uid, result.nodes, result.names);
        Ok(sig)
    }

    /// Nodes and names found by the last scan of a task.
    pub fn scan_result(&self, task: &Task) -> Option<(Vec<Node>, Vec<String>)> {
        self.store()
            .deps(&task.variant(), &task.uid())
            .map(|(nodes, names)| (nodes.to_vec(), names.to_vec()))
    }

    /// Decides whether a task must run. `states` holds the outcome of every
    /// task of the build so far, indexed by task id.
    pub fn runnable_status(
        &self,
        task: &Task,
        states: &[OnceLock<TaskState>],
    ) -> Result<RunStatus, SignatureError> {
        if !predecessors_ready(task, states) {
            return Ok(RunStatus::AskLater);
        }

        if !task.inputs().is_empty() && task.outputs().is_empty() && !task.quiet() {
            warn!("{task}: task has inputs but no outputs, is it misconfigured?");
        }

        let sig = self.signature(task)?;

        if task.kind().always_run {
            return Ok(RunStatus::RunMe);
        }

        let variant = task.variant();
        let store = self.store();

        for output in task.outputs() {
            let recorded = match output.variant() {
                Some(v) => store.node_sig(v, output).is_some(),
                None => output.path().exists(),
            };
            if !recorded {
                debug!("{task}: output {output:?} has no signature");
                return Ok(RunStatus::RunMe);
            }
        }

        let Some(prev) = store.task_sig(&variant, &task.uid()) else {
            debug!("{task}: never ran before");
            return Ok(RunStatus::RunMe);
        };

        if prev.composite != sig.composite {
            if enabled!(Level::DEBUG) {
                debug_why(task, &prev, &sig);
            }
            return Ok(RunStatus::RunMe);
        }

        Ok(RunStatus::SkipMe)
    }

    /// Records the outputs of a finished run. Returns the final state.
    pub(crate) fn post_run(&self, task: &Task) -> TaskState {
        let missing: Vec<Node> = task
            .outputs()
            .iter()
            .filter(|node| !node.path().is_file())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return TaskState::Missing(missing);
        }

        let sig = match self.signature(task) {
            Ok(sig) => sig,
            Err(err) => return TaskState::Exception(err.to_string()),
        };

        if let Err(err) = self.record(task, &sig) {
            return TaskState::Exception(err.to_string());
        }

        if let Some(cache) = &self.artifacts
            && !task.outputs().is_empty()
        {
            let paths: Vec<_> = task.outputs().iter().map(Node::path).collect();
            if let Err(err) = cache.store(&sig.composite, &paths) {
                warn!("{task}: could not store outputs in cache: {err}");
            }
        }

        TaskState::Success
    }

    fn record(&self, task: &Task, sig: &Signature) -> std::io::Result<()> {
        let variant = task.variant();

        for output in task.outputs() {
            let value = if task.kind().update_outputs {
                Hash32::hash_file(output.path())?
            } else {
                sig.composite
            };

            match output.variant() {
                Some(v) => self.store_mut().set_node_sig(v, output.clone(), value),
                None => self.forget(output),
            }
        }

        self.store_mut().set_task_sig(&variant, task.uid(), *sig);
        Ok(())
    }

    /// Tries to restore every output of a task from the artifact cache.
    pub(crate) fn retrieve_cached(&self, task: &Task) -> bool {
        let Some(cache) = &self.artifacts else {
            return false;
        };
        if self.options.nocache || task.outputs().is_empty() || task.kind().always_run {
            return false;
        }

        let Ok(sig) = self.signature(task) else {
            return false;
        };

        let paths: Vec<_> = task.outputs().iter().map(Node::path).collect();
        match cache.retrieve(&sig.composite, &paths) {
            Ok(()) => {}
            Err(CacheError::Miss(slot)) => {
                debug!("{task}: no cached outputs at {slot}");
                return false;
            }
            Err(err) => {
                warn!("{task}: could not restore outputs from cache: {err}");
                return false;
            }
        }

        match self.record(task, &sig) {
            Ok(()) => true,
            Err(err) => {
                warn!("{task}: restored outputs are unreadable: {err}");
                false
            }
        }
    }
}

pub(crate) fn predecessors_ready(task: &Task, states: &[OnceLock<TaskState>]) -> bool {
    task.run_after().all(|id| {
        states
            .get(id.index())
            .and_then(OnceLock::get)
            .is_some_and(TaskState::is_completed)
    })
}

fn debug_why(task: &Task, prev: &Signature, now: &Signature) {
    let mut parts = Vec::new();
    if prev.explicit != now.explicit {
        parts.push("explicit dependencies");
    }
    if prev.implicit != now.implicit {
        parts.push("implicit dependencies");
    }
    if prev.env != now.env {
        parts.push("environment");
    }
    debug!("{task}: signature changed ({})", parts.join(", "));
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::Options;
    use crate::env::Environment;
    use crate::task::{TaskId, TaskKind};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let engine = Engine::new(Options::new(&root, root.join("build")));
        engine.begin(["default"]);
        Fixture {
            _dir: dir,
            root,
            engine,
        }
    }

    impl Fixture {
        /// A task reading `inputs` from the source root and writing `out`
        /// into the default variant directory.
        fn task(&self, kind: TaskKind, env: Environment, inputs: &[&str], out: &str) -> Task {
            let layout = &self.engine.options().layout;
            let mut task = Task::new(TaskId(0), Arc::new(kind), Arc::new(env));
            task.inputs = inputs.iter().map(|name| layout.src(name)).collect();
            task.outputs.push(layout.out("default", out));
            task
        }
    }

    fn copy_kind() -> TaskKind {
        TaskKind::func("copy", "copy-v1", |_| Ok(())).vars(["FLAGS"]).build()
    }

    #[test]
    fn test_uid_is_deterministic() {
        let fx = fixture();
        let a = fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o");
        let b = fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o");
        assert_eq!(a.uid(), b.uid());

        let other = fx.task(
            TaskKind::func("copy", "copy-v2", |_| Ok(())).build(),
            Environment::new(),
            &["a.c"],
            "a.o",
        );
        assert_ne!(a.uid(), other.uid());
    }

    #[test]
    fn test_signature_parts() {
        let fx = fixture();
        let src = fx.root.join("a.c");
        fs::write(&src, "one").unwrap();

        let mut env = Environment::new();
        env.set("FLAGS", "-O2");
        let first = fx
            .engine
            .signature(&fx.task(copy_kind(), env.clone(), &["a.c"], "a.o"))
            .unwrap();

        env.set("FLAGS", "-O3");
        let flagged = fx
            .engine
            .signature(&fx.task(copy_kind(), env.clone(), &["a.c"], "a.o"))
            .unwrap();
        assert_eq!(first.explicit, flagged.explicit);
        assert_ne!(first.env, flagged.env);
        assert_ne!(first.composite, flagged.composite);
        assert_eq!(first.implicit, Hash32::default());

        // Unrelated variables do not matter.
        env.set("FLAGS", "-O2").set("OTHER", "x");
        let unrelated = fx
            .engine
            .signature(&fx.task(copy_kind(), env, &["a.c"], "a.o"))
            .unwrap();
        assert_eq!(first, unrelated);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let fx = fixture();
        let err = fx
            .engine
            .signature(&fx.task(copy_kind(), Environment::new(), &["nope.c"], "a.o"))
            .unwrap_err();
        assert!(matches!(err, SignatureError::MissingInput(_)));
    }

    #[test]
    fn test_runnable_status_lifecycle() {
        let fx = fixture();
        let src = fx.root.join("a.c");
        fs::write(&src, "one").unwrap();
        let states: Vec<OnceLock<TaskState>> = vec![OnceLock::new()];

        let t = fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o");
        assert_eq!(fx.engine.runnable_status(&t, &states).unwrap(), RunStatus::RunMe);

        fs::create_dir_all(t.outputs()[0].parent()).unwrap();
        fs::write(t.outputs()[0].path(), "obj").unwrap();
        assert_eq!(fx.engine.post_run(&t), TaskState::Success);

        let again = fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o");
        assert_eq!(
            fx.engine.runnable_status(&again, &states).unwrap(),
            RunStatus::SkipMe
        );

        // A deleted output is forgotten at the start of the next run.
        fs::remove_file(t.outputs()[0].path()).unwrap();
        fx.engine.begin(["default"]);
        let third = fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o");
        assert_eq!(
            fx.engine.runnable_status(&third, &states).unwrap(),
            RunStatus::RunMe
        );
    }

    #[test]
    fn test_missing_output_after_run() {
        let fx = fixture();
        let src = fx.root.join("a.c");
        fs::write(&src, "one").unwrap();
        let t = fx.task(copy_kind(), Environment::new(), &["a.c"], "never.o");
        assert!(matches!(fx.engine.post_run(&t), TaskState::Missing(nodes) if nodes.len() == 1));
    }

    #[test]
    fn test_ask_later_until_predecessor_completes() {
        let fx = fixture();
        let mut t = fx.task(copy_kind(), Environment::new(), &[], "x");
        t.run_after.insert(TaskId(1));
        let states: Vec<OnceLock<TaskState>> = vec![OnceLock::new(), OnceLock::new()];

        assert_eq!(
            fx.engine.runnable_status(&t, &states).unwrap(),
            RunStatus::AskLater
        );
        states[1].set(TaskState::Crashed(1)).unwrap();
        assert_eq!(
            fx.engine.runnable_status(&t, &states).unwrap(),
            RunStatus::AskLater
        );

        let states: Vec<OnceLock<TaskState>> = vec![OnceLock::new(), OnceLock::new()];
        states[1].set(TaskState::Skipped).unwrap();
        assert_eq!(
            fx.engine.runnable_status(&t, &states).unwrap(),
            RunStatus::RunMe
        );
    }

    #[test]
    fn test_manual_dependency_values() {
        let mut fx = fixture();
        let src = fx.root.join("a.c");
        fs::write(&src, "one").unwrap();
        let node = Node::source(&src);

        let before = fx
            .engine
            .signature(&fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o"))
            .unwrap();

        fx.engine
            .manual_deps
            .entry(node)
            .or_default()
            .push(ManualDep::Resolver(Arc::new(|| b"v2".to_vec())));
        let after = fx
            .engine
            .signature(&fx.task(copy_kind(), Environment::new(), &["a.c"], "a.o"))
            .unwrap();

        assert_ne!(before.explicit, after.explicit);
        assert_eq!(before.env, after.env);
    }
}
