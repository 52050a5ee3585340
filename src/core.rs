use std::fmt;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for identity and change detection.
///
/// In `kiln`, this serves three purposes:
/// 1. It is the unique id of a task, stable across process restarts.
/// 2. It is the composite signature of a task and each of its three parts.
/// 3. It names slots in the global artifact cache (`<hex>-<ordinal>`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// Incremental BLAKE3 hasher.
///
/// Implements [`std::hash::Hasher`] so derived `Hash` impls can be fed into a
/// stable 32-byte digest, and offers a few framing helpers so that adjacent
/// fields never run together.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a length-prefixed string.
    pub fn field(&mut self, value: &str) -> &mut Self {
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn digest(&mut self, hash: &Hash32) -> &mut Self {
        self.0.update(hash.as_bytes());
        self
    }

    pub fn finish32(&self) -> Hash32 {
        let bytes: [u8; 32] = self.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        value.finish32()
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// A file-system entity: an absolute path plus an optional build variant.
///
/// Source nodes carry no variant. Build nodes live under a variant directory
/// and their signatures are tracked per variant. Two nodes are equal iff both
/// the path and the variant match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    path: Utf8PathBuf,
    variant: Option<ArcStr>,
}

impl Node {
    pub fn source(path: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            variant: None,
        }
    }

    pub fn build(path: impl AsRef<Utf8Path>, variant: impl Into<ArcStr>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            variant: Some(variant.into()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn is_source(&self) -> bool {
        self.variant.is_none()
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or_default()
    }

    pub fn parent(&self) -> &Utf8Path {
        self.path.parent().unwrap_or(&self.path)
    }

    /// Extension including the leading dot, e.g. `.c`.
    pub fn suffix(&self) -> Option<String> {
        self.path.extension().map(|ext| format!(".{ext}"))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}@{}", self.path, variant),
            None => write!(f, "{}", self.path),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source and build roots of a project.
#[derive(Debug, Clone)]
pub struct Layout {
    pub top_dir: Utf8PathBuf,
    pub out_dir: Utf8PathBuf,
}

impl Layout {
    pub fn new(top_dir: impl AsRef<Utf8Path>, out_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            top_dir: normalize_path(top_dir.as_ref()),
            out_dir: normalize_path(out_dir.as_ref()),
        }
    }

    pub fn variant_dir(&self, variant: &str) -> Utf8PathBuf {
        self.out_dir.join(variant)
    }

    /// Node for a path relative to the source root.
    pub fn src(&self, path: impl AsRef<Utf8Path>) -> Node {
        Node::source(self.top_dir.join(path))
    }

    /// Node for a path relative to a variant directory.
    pub fn out(&self, variant: &str, path: impl AsRef<Utf8Path>) -> Node {
        Node::build(self.variant_dir(variant).join(path), variant)
    }

    /// Classifies an absolute path found on disk, e.g. by the include scanner.
    pub fn classify(&self, path: impl AsRef<Utf8Path>, variant: &str) -> Node {
        let path = normalize_path(path.as_ref());
        if path.starts_with(self.variant_dir(variant)) {
            Node::build(path, variant)
        } else {
            Node::source(path)
        }
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// This may cause incorrect or surprising behavior at times. This should be
/// used carefully. Unfortunately, [`std::fs::canonicalize`] can be hard to use
/// correctly, since it can often fail, or on Windows returns annoying device
/// paths.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => {}
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = Hash32::hash(b"kiln");
        let b = Hash32::hash(b"kiln");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert_ne!(a, Hash32::hash(b"kilm"));
    }

    #[test]
    fn test_hasher_fields_do_not_run_together() {
        let mut a = Blake3Hasher::new();
        a.field("ab").field("c");
        let mut b = Blake3Hasher::new();
        b.field("a").field("bc");
        assert_ne!(a.finish32(), b.finish32());
    }

    #[test]
    fn test_node_identity() {
        let a = Node::source("/src/./a/../x.c");
        let b = Node::source("/src/x.c");
        assert_eq!(a, b);
        assert_ne!(Node::build("/src/x.c", "debug"), b);
        assert_eq!(a.suffix().as_deref(), Some(".c"));
        assert_eq!(a.name(), "x.c");
    }

    #[test]
    fn test_layout_classify() {
        let layout = Layout::new("/proj", "/proj/build");
        assert!(layout.classify("/proj/inc/a.h", "default").is_source());
        let generated = layout.classify("/proj/build/default/gen.h", "default");
        assert_eq!(generated.variant(), Some("default"));
        assert_eq!(layout.out("default", "x.o").path(), "/proj/build/default/x.o");
    }
}
