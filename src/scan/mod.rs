//! Implicit dependency discovery.
//!
//! A task kind may carry a [`Scanner`]. Its result feeds the implicit part
//! of the task signature and is stored so that later runs can reuse it.

mod cparser;
mod expr;
mod filter;
mod lexer;
mod macros;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::core::{Layout, Node};
use crate::error::ScanError;
use crate::task::Task;

pub use filter::ParseCache;

/// What a scan found: headers that exist, and names that could not be
/// resolved yet (typically files generated later in the build).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub nodes: Vec<Node>,
    pub names: Vec<String>,
}

/// Shared state handed to every scanner call of a build.
pub struct ScanContext<'a> {
    pub layout: &'a Layout,
    pub cache: &'a ParseCache,
    /// Upper bound on files visited by a single scan.
    pub max_files: usize,
}

pub trait Scanner: Send + Sync {
    fn scan(&self, task: &Task, cx: &ScanContext<'_>) -> Result<ScanResult, ScanError>;
}

impl<F> Scanner for F
where
    F: Fn(&Task, &ScanContext<'_>) -> Result<ScanResult, ScanError> + Send + Sync,
{
    fn scan(&self, task: &Task, cx: &ScanContext<'_>) -> Result<ScanResult, ScanError> {
        self(task, cx)
    }
}

/// Preprocessor-aware scanner for C and C++ sources.
///
/// Search paths are read from the task environment (`INCPATHS`, relative
/// entries resolved against the source root), followed by any fixed paths
/// given here. Predefined macros come from `DEFLINES` (`NAME VALUE`) and
/// `DEFINES` (`NAME=VALUE`).
#[derive(Debug, Clone, Default)]
pub struct CScanner {
    paths: Vec<Utf8PathBuf>,
}

impl CScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    fn include_paths(&self, task: &Task, layout: &Layout) -> Vec<Utf8PathBuf> {
        let mut paths: Vec<Utf8PathBuf> = task
            .env()
            .get_list("INCPATHS")
            .into_iter()
            .map(|p| layout.top_dir.join(p))
            .collect();
        paths.extend(self.paths.iter().cloned());
        paths
    }

    fn define_lines(task: &Task) -> Vec<String> {
        let env = task.env();
        let mut lines = env.get_list("DEFLINES");
        lines.extend(env.get_list("DEFINES").into_iter().map(|define| {
            match define.split_once('=') {
                Some((name, value)) => format!("{name} {value}"),
                None => define,
            }
        }));
        lines
    }
}

impl Scanner for CScanner {
    fn scan(&self, task: &Task, cx: &ScanContext<'_>) -> Result<ScanResult, ScanError> {
        let variant = task.variant();
        let paths = self.include_paths(task, cx.layout);
        let defines = Self::define_lines(task);

        let mut result = ScanResult::default();
        for input in task.inputs() {
            let mut parser = cparser::CParser::new(cx, &variant, &paths);
            for line in &defines {
                // A malformed predefined macro is reported on the input itself.
                parser
                    .macros
                    .define(line)
                    .map_err(|reason| ScanError::Directive {
                        file: input.path().to_path_buf(),
                        line: format!("define {line}"),
                        reason,
                    })?;
            }
            parser.start(input.path())?;

            for node in parser.nodes {
                if !result.nodes.contains(&node) {
                    result.nodes.push(node);
                }
            }
            for name in parser.names {
                if !result.names.contains(&name) {
                    result.names.push(name);
                }
            }
        }

        debug!(
            "scanned {}: {} nodes, {} unresolved",
            task,
            result.nodes.len(),
            result.names.len()
        );
        Ok(result)
    }
}
