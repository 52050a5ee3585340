//! Signature engine and batch executor.
//!
//! The [`Engine`] holds everything tasks share while a build runs: the
//! persisted [`Store`], the scanner's parse cache, content hashes of source
//! files and the manual dependencies. It is shared by reference between the
//! worker threads; every piece of mutable state sits behind its own lock.

mod cache;
pub(crate) mod runner;
mod signature;
mod store;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::config::Options;
use crate::core::{Hash32, Node};
use crate::error::StoreError;
use crate::scan::ParseCache;

pub use cache::ArtifactCache;
pub use signature::Signature;
pub use store::{STORE_FILE, Store};

/// An extra dependency attached to a node with
/// [`crate::Build::add_manual_dependency`].
#[derive(Clone)]
pub enum ManualDep {
    /// Another file; its directory is rescanned whenever the dependency is
    /// hashed.
    Node(Node),
    /// A literal value, e.g. a version string.
    Value(Vec<u8>),
    /// Computed each time a signature is derived.
    Resolver(Arc<dyn Fn() -> Vec<u8> + Send + Sync>),
}

impl fmt::Debug for ManualDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManualDep::Node(node) => write!(f, "Node({node:?})"),
            ManualDep::Value(bytes) => write!(f, "Value({} bytes)", bytes.len()),
            ManualDep::Resolver(_) => f.write_str("Resolver"),
        }
    }
}

/// Content hashes of source files, computed at most once per run.
#[derive(Debug, Default)]
struct SourceSigs {
    /// Directories listed so far, with the regular files they contain.
    listed: HashMap<Utf8PathBuf, HashSet<String>>,
    hashes: HashMap<Node, Hash32>,
}

pub struct Engine {
    pub(crate) options: Options,
    store: RwLock<Store>,
    pub(crate) parse_cache: ParseCache,
    sources: Mutex<SourceSigs>,
    pub(crate) manual_deps: HashMap<Node, Vec<ManualDep>>,
    pub(crate) artifacts: Option<ArtifactCache>,
}

impl Engine {
    pub fn new(options: Options) -> Self {
        let artifacts = options.cache_dir.clone().map(ArtifactCache::new);
        Self {
            store: RwLock::new(Store::new(&options.layout.out_dir)),
            parse_cache: ParseCache::new(),
            sources: Mutex::new(SourceSigs::default()),
            manual_deps: HashMap::new(),
            artifacts,
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn store(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn store_mut(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sources(&self) -> MutexGuard<'_, SourceSigs> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepares for a new run: loads the state of every variant in use,
    /// forgets outputs deleted since the last run and drops source hashes
    /// and parsed headers.
    pub(crate) fn begin<'a>(&self, variants: impl IntoIterator<Item = &'a str>) {
        let mut store = self.store_mut();
        for variant in variants {
            store.load(variant);
        }
        let pruned = store.prune_missing();
        if pruned > 0 {
            debug!("forgot {pruned} output(s) removed since the last run");
        }
        drop(store);

        let mut sources = self.sources();
        sources.listed.clear();
        sources.hashes.clear();
        self.parse_cache.clear();
    }

    pub(crate) fn save(&self) -> Result<(), StoreError> {
        self.store().save()
    }

    /// Lists `dir` anew and forgets the hashes of files inside it.
    pub(crate) fn rescan(&self, dir: &Utf8Path) {
        let files = list_files(dir);
        let mut sources = self.sources();
        sources.hashes.retain(|node, _| node.parent() != dir);
        sources.listed.insert(dir.to_path_buf(), files);
    }

    /// Forgets the hash of a source node after a task wrote it. A file new to
    /// an already listed directory is added to the listing.
    pub(crate) fn forget(&self, node: &Node) {
        let mut sources = self.sources();
        sources.hashes.remove(node);
        if let Some(files) = sources.listed.get_mut(node.parent()) {
            files.insert(node.name().to_string());
        }
    }

    /// Content hash of a source file, or `None` if it does not exist.
    pub(crate) fn source_sig(&self, node: &Node) -> Option<Hash32> {
        let dir = node.parent().to_path_buf();
        {
            let mut sources = self.sources();
            if let Some(hash) = sources.hashes.get(node) {
                return Some(*hash);
            }
            if !sources.listed.contains_key(&dir) {
                let files = list_files(&dir);
                sources.listed.insert(dir.clone(), files);
            }
            if !sources
                .listed
                .get(&dir)
                .is_some_and(|files| files.contains(node.name()))
            {
                return None;
            }
        }

        // Hash without holding the lock; a concurrent duplicate is harmless.
        let hash = Hash32::hash_file(node.path()).ok()?;
        self.sources().hashes.insert(node.clone(), hash);
        Some(hash)
    }

    /// Last known signature of any node: the content hash for sources, the
    /// recorded signature for build nodes. A build node nobody recorded but
    /// which exists on disk is hashed directly.
    pub(crate) fn node_sig(&self, node: &Node) -> Option<Hash32> {
        match node.variant() {
            None => self.source_sig(node),
            Some(variant) => self
                .store()
                .node_sig(variant, node)
                .or_else(|| Hash32::hash_file(node.path()).ok()),
        }
    }
}

fn list_files(dir: &Utf8Path) -> HashSet<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return HashSet::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_sigs_follow_listing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let engine = Engine::new(Options::new(&root, root.join("build")));

        let a = Node::source(root.join("a.c"));
        fs::write(a.path(), "int a;").unwrap();
        let first = engine.source_sig(&a).unwrap();

        // Cached until the directory is rescanned.
        fs::write(a.path(), "int b;").unwrap();
        assert_eq!(engine.source_sig(&a), Some(first));
        engine.rescan(&root);
        assert_ne!(engine.source_sig(&a), Some(first));

        // Files created after the listing are unknown until a rescan.
        let late = Node::source(root.join("late.c"));
        fs::write(late.path(), "").unwrap();
        assert_eq!(engine.source_sig(&late), None);
        engine.rescan(&root);
        assert!(engine.source_sig(&late).is_some());
    }

    #[test]
    fn test_written_source_joins_listing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let engine = Engine::new(Options::new(&root, root.join("build")));

        let seed = Node::source(root.join("seed.c"));
        fs::write(seed.path(), "").unwrap();
        assert!(engine.source_sig(&seed).is_some());

        let generated = Node::source(root.join("gen.c"));
        fs::write(generated.path(), "int g;").unwrap();
        engine.forget(&generated);
        assert_eq!(engine.source_sig(&generated), Some(Hash32::hash("int g;")));
    }

    #[test]
    fn test_build_node_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let engine = Engine::new(Options::new(&root, root.join("build")));
        engine.begin(["default"]);

        let out = engine.options().layout.out("default", "x.o");
        assert_eq!(engine.node_sig(&out), None);

        fs::create_dir_all(out.parent()).unwrap();
        fs::write(out.path(), "obj").unwrap();
        assert_eq!(engine.node_sig(&out), Some(Hash32::hash("obj")));

        let recorded = Hash32::hash("recorded");
        engine
            .store_mut()
            .set_node_sig("default", out.clone(), recorded);
        assert_eq!(engine.node_sig(&out), Some(recorded));
    }
}
