//! Per-node attribute storage.
//!
//! Every node on disk has a companion attribute set. The [`MetadataBackend`]
//! trait abstracts over where that set lives, so the tree, grant and upload
//! logic never touch the storage format directly. Mutations of one node are
//! serialized through an advisory per-node lock; unrelated nodes never
//! contend.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// The attribute set of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, Vec<u8>>);

impl Attributes {
    /// Creates an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a raw value.
    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.0.insert(key.into(), value);
    }

    /// Sets a string value.
    pub fn set_string(&mut self, key: impl Into<String>, value: &str) {
        self.0.insert(key.into(), value.as_bytes().to_vec());
    }

    /// Sets an integer value, stored as its decimal string.
    pub fn set_int64(&mut self, key: impl Into<String>, value: i64) {
        self.set_string(key, &value.to_string());
    }

    /// Returns the raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Returns the value for `key` as a string, if set and valid UTF-8.
    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::to_string)
    }

    /// Returns the value for `key` parsed as an integer.
    pub fn int64(&self, key: &str) -> Option<i64> {
        self.string(key).and_then(|s| s.parse().ok())
    }

    /// Returns true if `key` is set.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    /// Copies every entry of `other` into this set.
    pub fn merge(&mut self, other: Attributes) {
        self.0.extend(other.0);
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.0.iter()
    }

    /// Iterates over entries whose key starts with `prefix`.
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
        self.0
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exclusive advisory lock on one node's attribute set.
///
/// Released on drop. While held, callers must pass `acquire_lock = false` to
/// backend mutations on the same path.
pub struct MetadataLock {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    table: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
    path: PathBuf,
}

impl MetadataLock {
    /// The node path this lock protects.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MetadataLock {
    fn drop(&mut self) {
        self.guard.take();
        // drop the table entry once nobody else waits on it
        self.table
            .remove_if(&self.path, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Table of per-path mutexes backing [`MetadataLock`].
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockTable {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock for `path` is held.
    pub fn lock(&self, path: &Path) -> MetadataLock {
        let mutex = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_arc();
        MetadataLock {
            guard: Some(guard),
            table: self.locks.clone(),
            path: path.to_path_buf(),
        }
    }

    /// Number of paths that currently have a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no path is locked or waited on.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Storage for node attribute sets, keyed by the node's internal path.
pub trait MetadataBackend: Send + Sync {
    /// Short name of the backend, used in logs.
    fn name(&self) -> &'static str;

    /// Reads every attribute of the node. `NotFound` if the node has none.
    fn all(&self, path: &Path) -> FsResult<Attributes>;

    /// Merges `attrs` into the node's attribute set.
    fn set_multiple(&self, path: &Path, attrs: Attributes, acquire_lock: bool) -> FsResult<()>;

    /// Replaces the whole attribute set. The caller must hold the node lock.
    fn write_all(&self, path: &Path, attrs: Attributes) -> FsResult<()>;

    /// Removes one attribute. Removing an unset attribute is not an error.
    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> FsResult<()>;

    /// Deletes the whole attribute set of a node.
    fn purge(&self, path: &Path) -> FsResult<()>;

    /// Moves an attribute set along with a node that was renamed on disk.
    fn rename(&self, old: &Path, new: &Path) -> FsResult<()>;

    /// Takes the exclusive per-node lock.
    fn lock(&self, path: &Path) -> MetadataLock;

    /// Reads one attribute.
    fn get(&self, path: &Path, key: &str) -> FsResult<Vec<u8>> {
        let attrs = self.all(path)?;
        attrs
            .get(key)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| FsError::attr_unset(key, path))
    }

    /// Reads one attribute as a string.
    fn get_string(&self, path: &Path, key: &str) -> FsResult<String> {
        let v = self.get(path, key)?;
        String::from_utf8(v).map_err(|e| FsError::metadata("get", path, e))
    }

    /// Reads one attribute as an integer.
    fn get_int64(&self, path: &Path, key: &str) -> FsResult<i64> {
        let s = self.get_string(path, key)?;
        s.parse()
            .map_err(|e| FsError::metadata("get", path, format!("{}: {}", key, e)))
    }

    /// Sets one attribute under the node lock.
    fn set(&self, path: &Path, key: &str, value: Vec<u8>) -> FsResult<()> {
        let mut attrs = Attributes::new();
        attrs.set(key, value);
        self.set_multiple(path, attrs, true)
    }

    /// Atomic read-modify-write of a node's attribute set.
    ///
    /// `f` sees the current attributes (empty if the node has none) and may
    /// change them; the result replaces the stored set while the node lock
    /// is held.
    fn update(
        &self,
        path: &Path,
        f: &mut dyn FnMut(&mut Attributes) -> FsResult<()>,
    ) -> FsResult<Attributes> {
        let _lock = self.lock(path);
        let mut attrs = match self.all(path) {
            Ok(a) => a,
            Err(FsError::NotFound(_)) => Attributes::new(),
            Err(e) => return Err(e),
        };
        f(&mut attrs)?;
        self.write_all(path, attrs.clone())?;
        Ok(attrs)
    }
}

/// Process-local backend keeping all attribute sets in a map.
///
/// Used for tests and for ephemeral instances; nothing survives a restart.
pub struct MemoryBackend {
    data: RwLock<HashMap<PathBuf, Attributes>>,
    locks: LockTable,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            locks: LockTable::new(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn all(&self, path: &Path) -> FsResult<Attributes> {
        self.data
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.display().to_string()))
    }

    fn set_multiple(&self, path: &Path, attrs: Attributes, acquire_lock: bool) -> FsResult<()> {
        let _lock = acquire_lock.then(|| self.locks.lock(path));
        self.data
            .write()
            .entry(path.to_path_buf())
            .or_default()
            .merge(attrs);
        Ok(())
    }

    fn write_all(&self, path: &Path, attrs: Attributes) -> FsResult<()> {
        self.data.write().insert(path.to_path_buf(), attrs);
        Ok(())
    }

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> FsResult<()> {
        let _lock = acquire_lock.then(|| self.locks.lock(path));
        if let Some(attrs) = self.data.write().get_mut(path) {
            attrs.remove(key);
        }
        Ok(())
    }

    fn purge(&self, path: &Path) -> FsResult<()> {
        self.data.write().remove(path);
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        let mut data = self.data.write();
        if let Some(attrs) = data.remove(old) {
            data.insert(new.to_path_buf(), attrs);
        }
        Ok(())
    }

    fn lock(&self, path: &Path) -> MetadataLock {
        self.locks.lock(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_attributes_typed_access() {
        let mut a = Attributes::new();
        a.set_string("k.name", "report.pdf");
        a.set_int64("k.size", 42);
        assert_eq!(a.string("k.name").as_deref(), Some("report.pdf"));
        assert_eq!(a.int64("k.size"), Some(42));
        assert_eq!(a.int64("k.name"), None);
        assert!(a.get("k.missing").is_none());
    }

    #[test]
    fn test_attributes_with_prefix() {
        let mut a = Attributes::new();
        a.set_string("grant.u:alice", "1");
        a.set_string("grant.g:staff", "2");
        a.set_string("name", "x");
        let keys: Vec<_> = a.with_prefix("grant.").map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["grant.g:staff", "grant.u:alice"]);
    }

    #[test]
    fn test_memory_set_get_remove() {
        let b = MemoryBackend::new();
        let p = Path::new("/n/1");
        assert!(b.all(p).unwrap_err().is_not_found());
        b.set(p, "a", b"1".to_vec()).unwrap();
        assert_eq!(b.get_int64(p, "a").unwrap(), 1);
        b.remove(p, "a", true).unwrap();
        assert!(b.get(p, "a").unwrap_err().is_attr_unset());
    }

    #[test]
    fn test_memory_rename_and_purge() {
        let b = MemoryBackend::new();
        b.set(Path::new("/old"), "a", b"x".to_vec()).unwrap();
        b.rename(Path::new("/old"), Path::new("/new")).unwrap();
        assert!(b.all(Path::new("/old")).is_err());
        assert_eq!(b.get_string(Path::new("/new"), "a").unwrap(), "x");
        b.purge(Path::new("/new")).unwrap();
        assert!(b.all(Path::new("/new")).is_err());
    }

    #[test]
    fn test_update_removes_dropped_keys() {
        let b = MemoryBackend::new();
        let p = Path::new("/n");
        b.set(p, "keep", b"1".to_vec()).unwrap();
        b.set(p, "drop", b"2".to_vec()).unwrap();
        b.update(p, &mut |a| {
            a.remove("drop");
            a.set_string("new", "3");
            Ok(())
        })
        .unwrap();
        let all = b.all(p).unwrap();
        assert!(all.contains("keep"));
        assert!(all.contains("new"));
        assert!(!all.contains("drop"));
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let b = Arc::new(MemoryBackend::new());
        let p = PathBuf::from("/counter");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                let p = p.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        b.update(&p, &mut |a| {
                            let v = a.int64("n").unwrap_or(0);
                            a.set_int64("n", v + 1);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.get_int64(&p, "n").unwrap(), 400);
    }

    #[test]
    fn test_lock_table_releases_entries() {
        let table = LockTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _l = table.lock(Path::new("/a"));
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
