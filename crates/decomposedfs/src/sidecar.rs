//! Metadata backend storing each node's attributes in a sidecar file.
//!
//! The attribute set of the node at `<path>` lives in `<path>.meta`, encoded
//! with bincode. Writes go to a temporary file that is renamed over the
//! sidecar, so readers see either the old or the new set, never a torn one.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::metadata::{Attributes, LockTable, MetadataBackend, MetadataLock};

const META_SUFFIX: &str = ".meta";

/// Sidecar-file metadata backend.
pub struct SidecarBackend {
    locks: LockTable,
}

impl SidecarBackend {
    /// Creates a new backend.
    pub fn new() -> Self {
        Self {
            locks: LockTable::new(),
        }
    }

    /// Path of the sidecar file for the node at `path`.
    pub fn metadata_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_os_string();
        p.push(META_SUFFIX);
        PathBuf::from(p)
    }

    fn read(&self, path: &Path) -> FsResult<Option<Attributes>> {
        match fs::read(Self::metadata_path(path)) {
            Ok(bytes) => {
                let attrs = bincode::deserialize(&bytes)
                    .map_err(|e| FsError::metadata("read", path, e))?;
                Ok(Some(attrs))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsError::metadata("read", path, e)),
        }
    }

    fn write(&self, path: &Path, attrs: &Attributes) -> FsResult<()> {
        let target = Self::metadata_path(path);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|e| FsError::metadata("write", path, e))?;
        }
        let bytes = bincode::serialize(attrs)?;
        let mut tmp = target.as_os_str().to_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(|e| FsError::metadata("write", path, e))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(FsError::metadata("write", path, e));
        }
        Ok(())
    }
}

impl Default for SidecarBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataBackend for SidecarBackend {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    fn all(&self, path: &Path) -> FsResult<Attributes> {
        self.read(path)?
            .ok_or_else(|| FsError::NotFound(path.display().to_string()))
    }

    fn set_multiple(&self, path: &Path, attrs: Attributes, acquire_lock: bool) -> FsResult<()> {
        let _lock = acquire_lock.then(|| self.locks.lock(path));
        let mut current = self.read(path)?.unwrap_or_default();
        current.merge(attrs);
        self.write(path, &current)
    }

    fn write_all(&self, path: &Path, attrs: Attributes) -> FsResult<()> {
        self.write(path, &attrs)
    }

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> FsResult<()> {
        let _lock = acquire_lock.then(|| self.locks.lock(path));
        match self.read(path)? {
            Some(mut current) => {
                if current.remove(key).is_some() {
                    self.write(path, &current)?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn purge(&self, path: &Path) -> FsResult<()> {
        match fs::remove_file(Self::metadata_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::metadata("purge", path, e)),
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        debug!(old = %old.display(), new = %new.display(), "renaming metadata");
        match fs::rename(Self::metadata_path(old), Self::metadata_path(new)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::metadata("rename", old, e)),
        }
    }

    fn lock(&self, path: &Path) -> MetadataLock {
        self.locks.lock(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_read_back() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("nodes/ab/cd");
        let b = SidecarBackend::new();

        let mut attrs = Attributes::new();
        attrs.set_string("user.ocis.name", "a.txt");
        attrs.set_int64("user.ocis.blobsize", 100);
        b.set_multiple(&node, attrs, true).unwrap();

        assert!(SidecarBackend::metadata_path(&node).exists());
        assert_eq!(b.get_string(&node, "user.ocis.name").unwrap(), "a.txt");
        assert_eq!(b.get_int64(&node, "user.ocis.blobsize").unwrap(), 100);
    }

    #[test]
    fn test_missing_node_is_not_found() {
        let dir = TempDir::new().unwrap();
        let b = SidecarBackend::new();
        match b.all(&dir.path().join("nope")) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_keeps_existing_keys() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("n");
        let b = SidecarBackend::new();
        b.set(&node, "a", b"1".to_vec()).unwrap();
        b.set(&node, "b", b"2".to_vec()).unwrap();
        let all = b.all(&node).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_remove_rename_purge() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let b = SidecarBackend::new();
        b.set(&old, "a", b"1".to_vec()).unwrap();
        b.set(&old, "b", b"2".to_vec()).unwrap();
        b.remove(&old, "a", true).unwrap();
        b.rename(&old, &new).unwrap();
        let all = b.all(&new).unwrap();
        assert!(!all.contains("a"));
        assert!(all.contains("b"));
        b.purge(&new).unwrap();
        assert!(b.all(&new).is_err());
        // purging twice is fine
        b.purge(&new).unwrap();
    }

    #[test]
    fn test_corrupt_sidecar_is_reported() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("n");
        std::fs::write(SidecarBackend::metadata_path(&node), b"\xff\xff\xff").unwrap();
        let b = SidecarBackend::new();
        match b.all(&node) {
            Err(FsError::Metadata { op: "read", .. }) => {}
            other => panic!("expected Metadata error, got {:?}", other),
        }
    }
}
