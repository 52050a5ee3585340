//! Layered configuration store.
//!
//! An [`Environment`] maps variable names to string or list values. Lookups
//! that miss in the local table fall back to the parent chain, writes always
//! land in the local table, so a derived environment can be modified without
//! touching the one it was branched from.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::StoreError;

const DEFAULT_VARIANT: &str = "default";

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    List(Vec<String>),
}

impl Value {
    /// Space-joined form of the value.
    pub fn flat(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::List(items) => items.join(" "),
        }
    }

    pub fn to_list(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::List(items) => items.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::List(value)
    }
}

impl From<Vec<&str>> for Value {
    fn from(value: Vec<&str>) -> Self {
        Value::List(value.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Value {
    fn from(value: [&str; N]) -> Self {
        Value::List(value.into_iter().map(String::from).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    table: BTreeMap<String, Value>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branches off a child that sees every entry of `self` until it
    /// overrides it.
    pub fn derive(self: &Arc<Self>) -> Environment {
        Environment {
            table: BTreeMap::new(),
            parent: Some(self.clone()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut current = Some(self);
        while let Some(env) = current {
            if let Some(value) = env.table.get(key) {
                return Some(value);
            }
            current = env.parent.as_deref();
        }
        None
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key).map(Value::to_list).unwrap_or_default()
    }

    pub fn get_flat(&self, key: &str) -> String {
        self.get(key).map(Value::flat).unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.table.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) {
        self.table.remove(key);
    }

    pub fn append_value(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        let mut list = self.get_list(key);
        list.extend(value.into().to_list());
        self.set(key, list)
    }

    pub fn prepend_value(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        let mut list = value.into().to_list();
        list.extend(self.get_list(key));
        self.set(key, list)
    }

    /// Appends only the items not already present.
    pub fn append_unique(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        let mut list = self.get_list(key);
        for item in value.into().to_list() {
            if !list.contains(&item) {
                list.push(item);
            }
        }
        self.set(key, list)
    }

    /// Every key visible through the parent chain.
    pub fn keys(&self) -> BTreeSet<&str> {
        let mut keys = BTreeSet::new();
        let mut current = Some(self);
        while let Some(env) = current {
            keys.extend(env.table.keys().map(String::as_str));
            current = env.parent.as_deref();
        }
        keys
    }

    /// The build variant this environment configures.
    pub fn variant(&self) -> String {
        match self.get("VARIANT") {
            Some(value) => value.flat(),
            None => DEFAULT_VARIANT.to_string(),
        }
    }

    /// Hashes the named subset of entries, in the given order.
    pub fn hash_vars<S: AsRef<str>>(&self, names: &[S]) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        for name in names {
            let name = name.as_ref();
            hasher.field(name);
            match self.get(name) {
                Some(Value::Str(s)) => {
                    hasher.raw(b"s").field(s);
                }
                Some(Value::List(items)) => {
                    hasher.raw(b"l").raw(&(items.len() as u64).to_le_bytes());
                    for item in items {
                        hasher.field(item);
                    }
                }
                None => {
                    hasher.raw(b"-");
                }
            }
        }
        hasher.finish32()
    }

    /// Collapses the parent chain into a single table.
    pub fn merged(&self) -> BTreeMap<String, Value> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value.clone())))
            .collect()
    }

    pub fn store(&self, path: &Utf8Path) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let file = fs::File::create(path).map_err(io)?;
        ciborium::into_writer(&self.merged(), BufWriter::new(file)).map_err(|e| {
            StoreError::Encode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }

    pub fn load(path: &Utf8Path) -> Result<Self, StoreError> {
        let file = fs::File::open(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = ciborium::from_reader::<BTreeMap<String, Value>, _>(BufReader::new(file))
            .map_err(|e| StoreError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            table,
            parent: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_fallback_and_copy_on_branch() {
        let mut base = Environment::new();
        base.set("CC", "gcc").set("CFLAGS", ["-O2"]);
        let base = Arc::new(base);

        let mut child = base.derive();
        child.append_value("CFLAGS", "-g");

        assert_eq!(child.get_flat("CC"), "gcc");
        assert_eq!(child.get_flat("CFLAGS"), "-O2 -g");
        assert_eq!(base.get_flat("CFLAGS"), "-O2");
    }

    #[test]
    fn test_list_operations() {
        let mut env = Environment::new();
        env.append_unique("LIB", ["m", "z"]);
        env.append_unique("LIB", ["z", "pthread"]);
        env.prepend_value("LIB", "c");
        assert_eq!(env.get_list("LIB"), vec!["c", "m", "z", "pthread"]);
        assert_eq!(env.get_flat("MISSING"), "");
    }

    #[test]
    fn test_variant_default() {
        let mut env = Environment::new();
        assert_eq!(env.variant(), "default");
        env.set("VARIANT", "debug");
        assert_eq!(env.variant(), "debug");
    }

    #[test]
    fn test_hash_vars_tracks_only_named_entries() {
        let mut env = Environment::new();
        env.set("CC", "gcc").set("UNRELATED", "x");
        let before = env.hash_vars(&["CC"]);

        env.set("UNRELATED", "y");
        assert_eq!(before, env.hash_vars(&["CC"]));

        env.set("CC", "clang");
        assert_ne!(before, env.hash_vars(&["CC"]));
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("env.cbor");

        let mut base = Environment::new();
        base.set("CC", "gcc");
        let mut child = Arc::new(base).derive();
        child.set("DEFINES", ["A=1", "B"]);
        child.store(&path).unwrap();

        let loaded = Environment::load(&path).unwrap();
        assert_eq!(loaded.get_flat("CC"), "gcc");
        assert_eq!(loaded.get_list("DEFINES"), vec!["A=1", "B"]);
    }
}
