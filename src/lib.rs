#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod build;
mod config;
mod core;
mod engine;
mod env;
mod error;
pub mod kinds;
#[cfg(feature = "logging")]
mod logging;
mod scan;
mod sched;
mod task;

pub use crate::build::{Build, BuildReport, TaskBuilder};
pub use crate::config::{CACHE_ENV, Dispatch, MAX_INCLUDE_FILES, Options};
pub use crate::core::{Hash32, Layout, Node};
pub use crate::engine::runner::BatchSummary;
pub use crate::engine::{ArtifactCache, Engine, ManualDep, STORE_FILE, Signature, Store};
pub use crate::env::{Environment, Value};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::{LOG_ENV, init_logging};
pub use crate::scan::{CScanner, ParseCache, ScanContext, ScanResult, Scanner};
pub use crate::sched::{Batch, TaskGroup, TaskManager};
pub use crate::task::{
    AttrKey, AttrValue, CommandTemplate, KindBuilder, Registry, RunBehavior, RunFn, RunStatus,
    Task, TaskContext, TaskId, TaskKind, TaskState,
};
