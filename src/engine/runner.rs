use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{LazyLock, OnceLock};
use std::time::Instant;

use console::style;
use indicatif::ProgressStyle;
use tracing::{Level, debug, error, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::Engine;
use crate::engine::signature::predecessors_ready;
use crate::sched::Batch;
use crate::task::command;
use crate::task::{RunBehavior, RunStatus, Task, TaskContext, TaskId, TaskState};

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

/// Counts of what happened to the tasks of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub executed: usize,
    pub skipped: usize,
    pub restored: usize,
    pub failed: usize,
    /// Tasks still waiting on a predecessor when the batch ended.
    pub stuck: usize,
}

/// Shared progress of a whole build, used for the `[n/total]` prefix.
pub(crate) struct Progress {
    pub(crate) done: AtomicUsize,
    pub(crate) total: usize,
}

impl Progress {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total,
        }
    }
}

/// Runs one batch to completion.
///
/// Tasks are handed to the rayon pool as soon as their run-after
/// predecessors have completed, with at most `limit` in flight. The loop
/// ends when nothing is running and nothing else can start; tasks left
/// waiting at that point depend on a failure and are reported as stuck.
pub(crate) fn run_batch(
    engine: &Engine,
    tasks: &[Task],
    batch: &Batch,
    states: &[OnceLock<TaskState>],
    progress: &Progress,
) -> BatchSummary {
    let limit = batch
        .maxjobs
        .map_or(engine.options.jobs, |max| max.min(engine.options.jobs))
        .max(1);

    let mut summary = BatchSummary::default();
    let mut waiting: VecDeque<TaskId> = batch.tasks.iter().copied().collect();
    let mut in_flight = 0usize;

    let span = tracing::span!(Level::INFO, "batch");
    span.pb_set_style(&PROGRESS_STYLE);
    span.pb_set_length(batch.tasks.len() as u64);
    span.pb_set_message("Running tasks...");
    let _enter = span.enter();

    debug!(tasks = batch.tasks.len(), limit, "starting batch");
    let start = Instant::now();

    // The dispatch loop stays on the calling thread; only task bodies go to
    // the pool, so a single-threaded pool cannot starve it.
    rayon::in_place_scope(|s| {
        // `None` means the task was asked about too early and must wait.
        let (sender, receiver) = channel::<(TaskId, Option<TaskState>)>();

        loop {
            let mut deferred = VecDeque::new();
            while in_flight < limit
                && let Some(id) = waiting.pop_front()
            {
                let task = &tasks[id.index()];
                if !predecessors_ready(task, states) {
                    deferred.push_back(id);
                    continue;
                }

                in_flight += 1;
                let sender = sender.clone();
                s.spawn(move |_| {
                    let state = run_task(engine, task, states, progress);
                    // The receiver outlives every worker of this scope.
                    let _ = sender.send((id, state));
                });
            }
            deferred.append(&mut waiting);
            waiting = deferred;

            if in_flight == 0 {
                break;
            }

            let Ok((id, state)) = receiver.recv() else {
                break;
            };
            in_flight -= 1;

            let Some(state) = state else {
                waiting.push_back(id);
                continue;
            };

            match &state {
                TaskState::Success => summary.executed += 1,
                TaskState::Skipped => summary.skipped += 1,
                TaskState::Restored => summary.restored += 1,
                state if state.is_failure() => {
                    summary.failed += 1;
                    error!("{}: {state}", tasks[id.index()]);
                }
                _ => {}
            }

            if states[id.index()].set(state).is_err() {
                warn!("{}: finished twice", tasks[id.index()]);
            }
            span.pb_inc(1);
        }
    });

    summary.stuck = waiting.len();
    debug!(
        "batch finished in {}ms: {summary:?}",
        start.elapsed().as_millis()
    );
    summary
}

/// Decides, runs and records a single task. Returns `None` when the task
/// has to wait for a predecessor.
fn run_task(
    engine: &Engine,
    task: &Task,
    states: &[OnceLock<TaskState>],
    progress: &Progress,
) -> Option<TaskState> {
    let status = match engine.runnable_status(task, states) {
        Ok(status) => status,
        Err(err) => return Some(TaskState::Exception(err.to_string())),
    };

    match status {
        RunStatus::AskLater => return None,
        RunStatus::SkipMe => return Some(TaskState::Skipped),
        RunStatus::RunMe => {}
    }

    if engine.retrieve_cached(task) {
        debug!("{task}: restored from cache");
        return Some(TaskState::Restored);
    }

    let n = progress.done.fetch_add(1, Ordering::Relaxed) + 1;
    let width = progress.total.to_string().len();
    info!(
        "[{n:>width$}/{}] {}",
        progress.total,
        display_line(task),
    );

    if let Err(state) = execute(task) {
        return Some(state);
    }

    Some(engine.post_run(task))
}

fn display_line(task: &Task) -> String {
    let kind = task.kind();
    let described = task.describe();
    let rest = described.strip_prefix(kind.name()).unwrap_or(&described);
    format!("{}{rest}", style(kind.name()).fg(kind.color))
}

/// Runs the behavior of a task. Panics inside closures are caught and
/// reported like any other error.
fn execute(task: &Task) -> Result<(), TaskState> {
    for output in task.outputs() {
        if let Err(err) = std::fs::create_dir_all(output.parent()) {
            return Err(TaskState::Exception(format!(
                "could not create {}: {err}",
                output.parent()
            )));
        }
    }

    let result = catch_unwind(AssertUnwindSafe(|| match task.kind().run() {
        RunBehavior::Command(template) => {
            let line = template
                .render(task.env(), task.inputs(), task.outputs())
                .map_err(TaskState::Exception)?;
            debug!("{task}: {line}");

            let output = command::execute(&line, task.cwd())
                .map_err(|err| TaskState::Exception(format!("could not spawn `{line}`: {err}")))?;

            if !output.stdout.trim().is_empty() {
                info!("{}", output.stdout.trim_end());
            }
            if !output.stderr.trim().is_empty() {
                warn!("{}", output.stderr.trim_end());
            }

            match output.code {
                0 => Ok(()),
                code => Err(TaskState::Crashed(code)),
            }
        }
        RunBehavior::Func { f, .. } => {
            let context = TaskContext {
                task,
                env: task.env(),
            };
            f(&context).map_err(|err| TaskState::Exception(format!("{err:#}")))
        }
    }));

    match result {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };
            Err(TaskState::Exception(msg))
        }
    }
}
