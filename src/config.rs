use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Layout;
use crate::error::ConfigError;

/// Environment variable naming the global artifact cache directory.
pub const CACHE_ENV: &str = "KILN_CACHE";

/// Upper bound on files visited by a single include scan.
pub const MAX_INCLUDE_FILES: usize = 30000;

/// How the task manager turns a group into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Buckets with no pending predecessor run together, one layer at a time.
    #[default]
    Grouped,
    /// Bucket ordering is pushed down onto the tasks and the whole group is
    /// handed out at once.
    FullyParallel,
    /// Like [`Dispatch::Grouped`], with each batch capped by `maxjobs`.
    JobLimited,
}

impl FromStr for Dispatch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grouped" => Ok(Dispatch::Grouped),
            "parallel" => Ok(Dispatch::FullyParallel),
            "maxjobs" => Ok(Dispatch::JobLimited),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dispatch::Grouped => "grouped",
            Dispatch::FullyParallel => "parallel",
            Dispatch::JobLimited => "maxjobs",
        })
    }
}

/// Build options.
///
/// ```rust,no_run
/// use kiln::{Dispatch, Options};
///
/// let options = Options::new("/project", "/project/build")
///     .jobs(4)
///     .policy(Dispatch::JobLimited)
///     .keep_going(true);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub layout: Layout,
    pub jobs: usize,
    pub policy: Dispatch,
    pub cache_dir: Option<Utf8PathBuf>,
    pub nocache: bool,
    pub keep_going: bool,
    pub max_include_files: usize,
}

impl Options {
    /// Options with defaults; the artifact cache is taken from `KILN_CACHE`
    /// when set.
    pub fn new(top_dir: impl AsRef<Utf8Path>, out_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            layout: Layout::new(top_dir, out_dir),
            jobs: rayon::current_num_threads().max(1),
            policy: Dispatch::default(),
            cache_dir: std::env::var(CACHE_ENV)
                .ok()
                .filter(|dir| !dir.is_empty())
                .map(Utf8PathBuf::from),
            nocache: false,
            keep_going: false,
            max_include_files: MAX_INCLUDE_FILES,
        }
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn policy(mut self, policy: Dispatch) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache_dir(mut self, dir: Option<impl Into<Utf8PathBuf>>) -> Self {
        self.cache_dir = dir.map(Into::into);
        self
    }

    pub fn nocache(mut self, nocache: bool) -> Self {
        self.nocache = nocache;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn max_include_files(mut self, limit: usize) -> Self {
        self.max_include_files = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_from_str() {
        assert_eq!("grouped".parse::<Dispatch>().unwrap(), Dispatch::Grouped);
        assert_eq!("parallel".parse::<Dispatch>().unwrap(), Dispatch::FullyParallel);
        assert_eq!("maxjobs".parse::<Dispatch>().unwrap(), Dispatch::JobLimited);

        let err = "fastest".parse::<Dispatch>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPolicy(ref name) if name == "fastest"));
        assert!(err.to_string().contains("fastest"));
    }

    #[test]
    fn test_builder() {
        let options = Options::new("/p", "/p/build")
            .jobs(0)
            .cache_dir(Some("/tmp/cache"))
            .nocache(true);
        assert_eq!(options.jobs, 1);
        assert_eq!(options.cache_dir.as_deref(), Some(Utf8Path::new("/tmp/cache")));
        assert!(options.nocache);
        assert_eq!(options.layout.variant_dir("debug"), "/p/build/debug");
    }
}
