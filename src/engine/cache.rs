use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::error::CacheError;

/// Global, content-addressed store of task outputs, shared across projects.
///
/// Each output of a task is kept in a slot named `<signature>-<ordinal>`.
/// Eviction is left to an external janitor; a hit refreshes the slot's
/// modification time so that least recently used slots can be found.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: Utf8PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn slot(&self, sig: &Hash32, ordinal: usize) -> Utf8PathBuf {
        self.dir.join(format!("{}-{ordinal}", sig.to_hex()))
    }

    /// Copies the outputs of a task into their slots.
    pub fn store(&self, sig: &Hash32, outputs: &[&Utf8Path]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;

        for (ordinal, output) in outputs.iter().enumerate() {
            let slot = self.slot(sig, ordinal);
            let io = |source| CacheError::Io {
                path: slot.clone(),
                source,
            };

            // Copy under a private name first so readers never see half a file.
            let tmp = slot.with_extension(format!("tmp{}", std::process::id()));
            fs::copy(output, &tmp).map_err(io)?;
            fs::rename(&tmp, &slot).map_err(io)?;
        }
        Ok(())
    }

    /// Copies every slot of `sig` to the matching output path. Fails on the
    /// first missing slot; outputs already copied are left in place and get
    /// overwritten by the regular run that follows.
    pub fn retrieve(&self, sig: &Hash32, outputs: &[&Utf8Path]) -> Result<(), CacheError> {
        let slots: Vec<Utf8PathBuf> = (0..outputs.len()).map(|i| self.slot(sig, i)).collect();
        if let Some(missing) = slots.iter().find(|slot| !slot.is_file()) {
            return Err(CacheError::Miss(missing.clone()));
        }

        for (slot, output) in slots.iter().zip(outputs) {
            let io = |source| CacheError::Io {
                path: slot.clone(),
                source,
            };

            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::copy(slot, output).map_err(io)?;
            touch(slot).map_err(io)?;
        }
        Ok(())
    }
}

fn touch(path: &Utf8Path) -> std::io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_store_then_retrieve() {
        let work = tempfile::tempdir().unwrap();
        let root = utf8(&work);
        let cache = ArtifactCache::new(root.join("cache"));
        let sig = Hash32::hash(b"task");

        let a = root.join("a.o");
        let b = root.join("b.o");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();
        cache.store(&sig, &[a.as_path(), b.as_path()]).unwrap();

        assert!(cache.slot(&sig, 0).is_file());
        assert_eq!(fs::read(cache.slot(&sig, 1)).unwrap(), b"second");

        let restored = root.join("out/nested/a.o");
        let other = root.join("out/b.o");
        cache.retrieve(&sig, &[restored.as_path(), other.as_path()]).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"first");
        assert_eq!(fs::read(&other).unwrap(), b"second");
    }

    #[test]
    fn test_missing_slot_is_a_miss() {
        let work = tempfile::tempdir().unwrap();
        let root = utf8(&work);
        let cache = ArtifactCache::new(root.join("cache"));
        let target = root.join("x.o");

        let err = cache.retrieve(&Hash32::hash(b"none"), &[target.as_path()]).unwrap_err();
        assert!(matches!(err, CacheError::Miss(_)));
        assert!(!target.exists());
    }
}
