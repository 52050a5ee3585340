use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Node;
use crate::task::TaskState;

pub use anyhow::Error as RuntimeError;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while loading or saving the build state:\n{0}")]
    Store(#[from] StoreError),

    #[error("Build failed.\n{0}")]
    Build(#[from] BuildError),
}

/// Fatal problems with the shape of the build, reported before or instead of
/// running anything.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("circular order constraint between: {}", .0.join(", "))]
    CircularConstraint(Vec<String>),

    #[error("unknown dispatch policy '{0}' (expected grouped, parallel or maxjobs)")]
    UnknownPolicy(String),

    #[error("unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("task kind '{0}' is already registered")]
    DuplicateKind(String),

    #[error("kind '{kind}': invalid command template: {reason}")]
    Template { kind: String, reason: String },

    #[error("task group '{0}' does not exist")]
    UnknownGroup(String),
}

/// Low-level preprocessor failures, without file context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreprocError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unterminated literal")]
    Unterminated,

    #[error("invalid macro definition")]
    BadDefine,

    #[error("macro '{name}': {reason}")]
    BadInvocation { name: String, reason: String },

    #[error("could not resolve include argument")]
    BadInclude,
}

/// Failures of the dependency scanner. Fatal for the owning task only.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("include limit of {limit} files exceeded while scanning {origin}")]
    RecursionLimit { limit: usize, origin: Utf8PathBuf },

    #[error("{file}: `#{line}`: {reason}")]
    Directive {
        file: Utf8PathBuf,
        line: String,
        reason: PreprocError,
    },
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("input {0:?} has no recorded signature and does not exist")]
    MissingInput(Node),

    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Artifact cache failures. Never fatal, only logged.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("cache slot {0} is missing")]
    Miss(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("couldn't decode store {path}: {reason}")]
    Decode { path: Utf8PathBuf, reason: String },

    #[error("couldn't encode store {path}: {reason}")]
    Encode { path: Utf8PathBuf, reason: String },
}

/// One task that did not finish successfully.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub state: TaskState,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task '{}': {}", self.task, self.state)
    }
}

/// The build ran, but some tasks failed or were never started.
#[derive(Debug, Default, Error)]
pub struct BuildError {
    pub failures: Vec<TaskFailure>,
    pub unstarted: Vec<String>,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in &self.failures {
            writeln!(f, "{failure}")?;
        }
        if !self.unstarted.is_empty() {
            writeln!(f, "Not started: {}", self.unstarted.join(", "))?;
        }
        Ok(())
    }
}
