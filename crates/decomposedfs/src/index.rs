//! Persistent space indexes.
//!
//! Three indexes map a key (user id, group id or space type) to the spaces
//! it has access to. Each entry is one small file
//! `indexes/<index>/<key>/<space id>` holding the node id of the space root.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{FsError, FsResult};

/// An index of `(key, space_id) -> node_id` entries.
pub trait SpaceIndex: Send + Sync {
    /// Adds or replaces an entry.
    fn add(&self, key: &str, space_id: &str, node_id: &str) -> FsResult<()>;

    /// Removes an entry. Removing a missing entry is not an error.
    fn remove(&self, key: &str, space_id: &str) -> FsResult<()>;

    /// Loads every entry of `key` as a map of space id to node id.
    fn load(&self, key: &str) -> FsResult<HashMap<String, String>>;
}

fn escape(segment: &str) -> FsResult<String> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(FsError::BadRequest(format!("invalid index key {:?}", segment)));
    }
    Ok(segment.replace('%', "%25").replace('/', "%2F"))
}

fn unescape(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

/// A [`SpaceIndex`] backed by one file per entry.
pub struct FileIndex {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileIndex {
    /// Creates the index stored in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    /// Directory of the index.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SpaceIndex for FileIndex {
    fn add(&self, key: &str, space_id: &str, node_id: &str) -> FsResult<()> {
        let dir = self.root.join(escape(key)?);
        let _w = self.lock.write();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(escape(space_id)?), node_id.as_bytes())?;
        debug!(index = %self.root.display(), key, space_id, "added index entry");
        Ok(())
    }

    fn remove(&self, key: &str, space_id: &str) -> FsResult<()> {
        let entry = self.root.join(escape(key)?).join(escape(space_id)?);
        let _w = self.lock.write();
        match fs::remove_file(&entry) {
            Ok(()) => {
                debug!(index = %self.root.display(), key, space_id, "removed index entry");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, key: &str) -> FsResult<HashMap<String, String>> {
        let dir = self.root.join(escape(key)?);
        let _r = self.lock.read();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = HashMap::new();
        for entry in entries {
            let entry = entry?;
            let space_id = unescape(&entry.file_name().to_string_lossy());
            match fs::read_to_string(entry.path()) {
                Ok(node_id) => {
                    out.insert(space_id, node_id.trim().to_string());
                }
                // removed concurrently
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

/// The three space indexes.
#[derive(Clone)]
pub struct SpaceIndexes {
    /// Spaces a user has a grant on or owns.
    pub by_user: Arc<dyn SpaceIndex>,
    /// Spaces a group has a grant on.
    pub by_group: Arc<dyn SpaceIndex>,
    /// Spaces of each space type.
    pub by_type: Arc<dyn SpaceIndex>,
}

impl SpaceIndexes {
    /// File backed indexes below `root`.
    pub fn open(root: &Path) -> Self {
        Self {
            by_user: Arc::new(FileIndex::new(root.join("by-user-id"))),
            by_group: Arc::new(FileIndex::new(root.join("by-group-id"))),
            by_type: Arc::new(FileIndex::new(root.join("by-type"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_load_remove() {
        let dir = TempDir::new().unwrap();
        let idx = FileIndex::new(dir.path().join("by-user-id"));
        assert!(idx.load("alice").unwrap().is_empty());

        idx.add("alice", "s1", "s1").unwrap();
        idx.add("alice", "s2", "n2").unwrap();
        idx.add("bob", "s1", "s1").unwrap();

        let m = idx.load("alice").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m["s2"], "n2");

        idx.remove("alice", "s2").unwrap();
        idx.remove("alice", "s2").unwrap();
        assert_eq!(idx.load("alice").unwrap().len(), 1);
        assert_eq!(idx.load("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_keys_with_slashes() {
        let dir = TempDir::new().unwrap();
        let idx = FileIndex::new(dir.path());
        idx.add("idp/alice", "s1", "s1").unwrap();
        let m = idx.load("idp/alice").unwrap();
        assert_eq!(m.get("s1").map(String::as_str), Some("s1"));
        assert!(idx.add("..", "s1", "s1").is_err());
    }

    #[test]
    fn test_open_layout() {
        let dir = TempDir::new().unwrap();
        let idx = SpaceIndexes::open(dir.path());
        idx.by_type.add("project", "s1", "s1").unwrap();
        assert!(dir.path().join("by-type/project/s1").exists());
    }
}
