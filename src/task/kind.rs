use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use console::Color;

use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::scan::Scanner;
use crate::task::TaskContext;
use crate::task::command::CommandTemplate;

/// In-process run behavior.
pub type RunFn = Arc<dyn Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync>;

/// What a task does when it runs. Kept as data so it can be hashed into the
/// task identity.
#[derive(Clone)]
pub enum RunBehavior {
    Command(CommandTemplate),
    Func { id: ArcStr, f: RunFn },
}

impl RunBehavior {
    /// Stable identity of the behavior, part of every task uid.
    pub fn identity(&self) -> &str {
        match self {
            RunBehavior::Command(template) => template.as_str(),
            RunBehavior::Func { id, .. } => id,
        }
    }
}

impl fmt::Debug for RunBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunBehavior::Command(template) => write!(f, "Command({:?})", template.as_str()),
            RunBehavior::Func { id, .. } => write!(f, "Func({id})"),
        }
    }
}

/// Scheduling and signature attributes. A task reads them through
/// [`crate::Task::attr`], which consults the instance overrides before the
/// kind defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKey {
    Before,
    After,
    ExtIn,
    ExtOut,
    MaxJobs,
    Quiet,
    Vars,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttrValue {
    List(Vec<ArcStr>),
    Count(usize),
    Flag(bool),
}

impl AttrValue {
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        AttrValue::List(items.into_iter().map(|s| ArcStr::from(s.as_ref())).collect())
    }
}

/// A registered class of tasks: how to run them and how they order against
/// other kinds.
pub struct TaskKind {
    pub(crate) name: ArcStr,
    pub(crate) run: RunBehavior,
    pub(crate) defaults: HashMap<AttrKey, AttrValue>,
    pub(crate) scanner: Option<Arc<dyn Scanner>>,
    pub(crate) color: Color,
    pub(crate) always_run: bool,
    pub(crate) update_outputs: bool,
}

impl TaskKind {
    /// A kind running an external command.
    pub fn command(name: &str, template: &str) -> Result<KindBuilder, ConfigError> {
        let template: CommandTemplate =
            template
                .parse()
                .map_err(|reason| ConfigError::Template {
                    kind: name.to_string(),
                    reason,
                })?;

        Ok(KindBuilder::new(name, RunBehavior::Command(template)))
    }

    /// A kind running a closure. `id` must change whenever the closure's
    /// behavior does, since it is part of every task uid.
    pub fn func<F>(name: &str, id: &str, f: F) -> KindBuilder
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        KindBuilder::new(
            name,
            RunBehavior::Func {
                id: id.into(),
                f: Arc::new(f),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self) -> &RunBehavior {
        &self.run
    }

    pub fn scanner(&self) -> Option<&Arc<dyn Scanner>> {
        self.scanner.as_ref()
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskKind")
            .field("name", &self.name)
            .field("run", &self.run)
            .field("defaults", &self.defaults)
            .field("scanner", &self.scanner.is_some())
            .finish()
    }
}

pub struct KindBuilder {
    kind: TaskKind,
}

impl KindBuilder {
    fn new(name: &str, run: RunBehavior) -> Self {
        Self {
            kind: TaskKind {
                name: name.into(),
                run,
                defaults: HashMap::new(),
                scanner: None,
                color: Color::Green,
                always_run: false,
                update_outputs: false,
            },
        }
    }

    fn set(mut self, key: AttrKey, value: AttrValue) -> Self {
        self.kind.defaults.insert(key, value);
        self
    }

    pub fn ext_in<S: AsRef<str>>(self, exts: impl IntoIterator<Item = S>) -> Self {
        self.set(AttrKey::ExtIn, AttrValue::list(exts))
    }

    pub fn ext_out<S: AsRef<str>>(self, exts: impl IntoIterator<Item = S>) -> Self {
        self.set(AttrKey::ExtOut, AttrValue::list(exts))
    }

    pub fn before<S: AsRef<str>>(self, kinds: impl IntoIterator<Item = S>) -> Self {
        self.set(AttrKey::Before, AttrValue::list(kinds))
    }

    pub fn after<S: AsRef<str>>(self, kinds: impl IntoIterator<Item = S>) -> Self {
        self.set(AttrKey::After, AttrValue::list(kinds))
    }

    /// Environment variables that affect the output of this kind.
    pub fn vars<S: AsRef<str>>(self, vars: impl IntoIterator<Item = S>) -> Self {
        self.set(AttrKey::Vars, AttrValue::list(vars))
    }

    pub fn maxjobs(self, maxjobs: usize) -> Self {
        self.set(AttrKey::MaxJobs, AttrValue::Count(maxjobs.max(1)))
    }

    /// Silences the warning about tasks with inputs but no outputs.
    pub fn quiet(self) -> Self {
        self.set(AttrKey::Quiet, AttrValue::Flag(true))
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.kind.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.kind.color = color;
        self
    }

    /// Run whenever reached, regardless of signatures.
    pub fn always_run(mut self) -> Self {
        self.kind.always_run = true;
        self
    }

    /// Output node signatures become the hash of the produced bytes, so
    /// dependants only rebuild when the content actually changes.
    pub fn update_outputs(mut self) -> Self {
        self.kind.update_outputs = true;
        self
    }

    pub fn build(mut self) -> TaskKind {
        // Commands depend on the variables they reference unless told otherwise.
        if !self.kind.defaults.contains_key(&AttrKey::Vars)
            && let RunBehavior::Command(template) = &self.kind.run
        {
            let vars = AttrValue::list(template.vars());
            self.kind.defaults.insert(AttrKey::Vars, vars);
        }
        self.kind
    }
}

/// Explicit registry of task kinds.
#[derive(Debug, Default)]
pub struct Registry {
    kinds: HashMap<ArcStr, Arc<TaskKind>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind) -> Result<Arc<TaskKind>, ConfigError> {
        if self.kinds.contains_key(&kind.name) {
            return Err(ConfigError::DuplicateKind(kind.name.to_string()));
        }
        let kind = Arc::new(kind);
        self.kinds.insert(kind.name.clone(), kind.clone());
        Ok(kind)
    }

    pub fn get(&self, name: &str) -> Result<Arc<TaskKind>, ConfigError> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKind(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_vars_default_to_template_references() {
        let kind = TaskKind::command("cc", "${CC} -c ${SRC} -o ${TGT}")
            .unwrap()
            .build();
        assert_eq!(
            kind.defaults.get(&AttrKey::Vars),
            Some(&AttrValue::list(["CC"]))
        );

        let kind = TaskKind::command("cc", "${CC} -c ${SRC}")
            .unwrap()
            .vars(["CC", "CFLAGS"])
            .build();
        assert_eq!(
            kind.defaults.get(&AttrKey::Vars),
            Some(&AttrValue::list(["CC", "CFLAGS"]))
        );
    }

    #[test]
    fn test_bad_template_names_the_kind() {
        let err = TaskKind::command("broken", "${CC").err().unwrap();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_registry() {
        let mut registry = Registry::new();
        registry
            .register(TaskKind::func("copy", "copy-1", |_| Ok(())).build())
            .unwrap();

        assert!(registry.contains("copy"));
        assert!(matches!(
            registry.register(TaskKind::func("copy", "copy-2", |_| Ok(())).build()),
            Err(ConfigError::DuplicateKind(_))
        ));
        assert!(matches!(registry.get("link"), Err(ConfigError::UnknownKind(_))));
    }
}
