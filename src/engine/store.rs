use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Hash32, Node};
use crate::engine::Signature;
use crate::error::StoreError;

/// File name of the persisted state inside each variant directory.
pub const STORE_FILE: &str = ".kiln.cbor";

/// Everything remembered about one variant between runs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct VariantState {
    /// Last known signature of each build node.
    node_sigs: HashMap<Node, Hash32>,
    /// Last composite signature of each task, by task uid.
    task_sigs: HashMap<Hash32, Signature>,
    /// Last scan result of each task, by task uid.
    node_deps: HashMap<Hash32, Vec<Node>>,
    raw_deps: HashMap<Hash32, Vec<String>>,
}

/// Persisted signatures, one record set per variant directory.
#[derive(Debug)]
pub struct Store {
    out_dir: Utf8PathBuf,
    variants: BTreeMap<String, VariantState>,
}

impl Store {
    pub fn new(out_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            variants: BTreeMap::new(),
        }
    }

    fn path(&self, variant: &str) -> Utf8PathBuf {
        self.out_dir.join(variant).join(STORE_FILE)
    }

    /// Reads the state of `variant` from disk unless it is already loaded.
    /// A missing file is a first build; a corrupt one is discarded.
    pub fn load(&mut self, variant: &str) {
        if self.variants.contains_key(variant) {
            return;
        }

        let path = self.path(variant);
        let state = match read_state(&path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("no stored state for variant {variant}");
                VariantState::default()
            }
            Err(err) => {
                warn!("discarding build state: {err}");
                VariantState::default()
            }
        };
        self.variants.insert(variant.to_string(), state);
    }

    /// Writes every loaded variant through a temporary file and a rename.
    pub fn save(&self) -> Result<(), StoreError> {
        for (variant, state) in &self.variants {
            let path = self.path(variant);
            write_state(&path, state)?;
            debug!("saved build state to {path}");
        }
        Ok(())
    }

    /// Forgets build nodes whose files were removed since the last run.
    pub fn prune_missing(&mut self) -> usize {
        let mut pruned = 0;
        for state in self.variants.values_mut() {
            let before = state.node_sigs.len();
            state.node_sigs.retain(|node, _| node.path().exists());
            pruned += before - state.node_sigs.len();
        }
        pruned
    }

    fn state(&self, variant: &str) -> Option<&VariantState> {
        self.variants.get(variant)
    }

    fn state_mut(&mut self, variant: &str) -> &mut VariantState {
        self.variants.entry(variant.to_string()).or_default()
    }

    pub fn node_sig(&self, variant: &str, node: &Node) -> Option<Hash32> {
        self.state(variant)?.node_sigs.get(node).copied()
    }

    pub fn set_node_sig(&mut self, variant: &str, node: Node, sig: Hash32) {
        self.state_mut(variant).node_sigs.insert(node, sig);
    }

    pub fn task_sig(&self, variant: &str, uid: &Hash32) -> Option<Signature> {
        self.state(variant)?.task_sigs.get(uid).copied()
    }

    pub fn set_task_sig(&mut self, variant: &str, uid: Hash32, sig: Signature) {
        self.state_mut(variant).task_sigs.insert(uid, sig);
    }

    /// Last scan result of a task: resolved nodes and unresolved names.
    pub fn deps(&self, variant: &str, uid: &Hash32) -> Option<(&[Node], &[String])> {
        let state = self.state(variant)?;
        let nodes = state.node_deps.get(uid)?;
        let names = state.raw_deps.get(uid).map(Vec::as_slice).unwrap_or_default();
        Some((nodes, names))
    }

    pub fn set_deps(&mut self, variant: &str, uid: Hash32, nodes: Vec<Node>, names: Vec<String>) {
        let state = self.state_mut(variant);
        state.node_deps.insert(uid, nodes);
        state.raw_deps.insert(uid, names);
    }
}

fn read_state(path: &Utf8Path) -> Result<Option<VariantState>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    ciborium::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| StoreError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_state(path: &Utf8Path, state: &VariantState) -> Result<(), StoreError> {
    let io = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io)?;
    }

    let tmp = path.with_extension("cbor.tmp");
    let mut writer = BufWriter::new(fs::File::create(&tmp).map_err(io)?);
    ciborium::into_writer(state, &mut writer).map_err(|e| StoreError::Encode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    writer.flush().map_err(io)?;
    drop(writer);

    fs::rename(&tmp, path).map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(n: u8) -> Signature {
        let h = Hash32::hash([n]);
        Signature {
            composite: h,
            explicit: h,
            implicit: h,
            env: h,
        }
    }

    #[test]
    fn test_roundtrip_per_variant() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let uid = Hash32::hash(b"task");
        let node = Node::build(out.join("debug/a.o"), "debug");

        let mut store = Store::new(&out);
        store.load("debug");
        store.load("release");
        store.set_task_sig("debug", uid, sig(1));
        store.set_node_sig("debug", node.clone(), Hash32::hash(b"a"));
        store.set_deps("debug", uid, vec![Node::source("/x/y.h")], vec!["gen.h".into()]);
        store.save().unwrap();

        assert!(out.join("debug").join(STORE_FILE).is_file());
        assert!(out.join("release").join(STORE_FILE).is_file());

        let mut reloaded = Store::new(&out);
        reloaded.load("debug");
        assert_eq!(reloaded.task_sig("debug", &uid), Some(sig(1)));
        assert_eq!(reloaded.node_sig("debug", &node), Some(Hash32::hash(b"a")));
        let (nodes, names) = reloaded.deps("debug", &uid).unwrap();
        assert_eq!(nodes, &[Node::source("/x/y.h")]);
        assert_eq!(names, &["gen.h".to_string()]);
        assert_eq!(reloaded.task_sig("release", &uid), None);
    }

    #[test]
    fn test_corrupt_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(out.join("default")).unwrap();
        fs::write(out.join("default").join(STORE_FILE), b"not cbor at all").unwrap();

        let mut store = Store::new(&out);
        store.load("default");
        assert_eq!(store.task_sig("default", &Hash32::hash(b"x")), None);
    }

    #[test]
    fn test_prune_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let kept = Node::build(out.join("default/kept.o"), "default");
        let gone = Node::build(out.join("default/gone.o"), "default");
        fs::create_dir_all(out.join("default")).unwrap();
        fs::write(kept.path(), b"").unwrap();

        let mut store = Store::new(&out);
        store.set_node_sig("default", kept.clone(), Hash32::hash(b"k"));
        store.set_node_sig("default", gone.clone(), Hash32::hash(b"g"));

        assert_eq!(store.prune_missing(), 1);
        assert!(store.node_sig("default", &kept).is_some());
        assert!(store.node_sig("default", &gone).is_none());
    }
}
