//! In-memory view of one tree entry.
//!
//! A [`Node`] is a snapshot of the identifying attributes of a file,
//! directory or space root. Everything else is read from the metadata
//! backend on demand, so a node value never goes stale in a way that
//! matters for correctness: mutating helpers always go through the backend.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::attrs;
use crate::error::{FsError, FsResult};
use crate::grants::Grant;
use crate::locks::Lock;
use crate::lookup::Lookup;
use crate::metadata::Attributes;
use crate::permissions::PermissionSet;
use crate::types::{format_time, parse_time, Grantee, ResourceId, User, UserId};

/// Kind of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A regular file backed by a blob.
    File,
    /// A directory.
    Directory,
    /// The root directory of a space.
    SpaceRoot,
}

impl NodeKind {
    /// Value stored in the type attribute.
    pub fn as_i64(&self) -> i64 {
        match self {
            NodeKind::File => 1,
            NodeKind::Directory | NodeKind::SpaceRoot => 2,
        }
    }

    /// Returns true for directories and space roots.
    pub fn is_dir(&self) -> bool {
        !matches!(self, NodeKind::File)
    }
}

/// Computes the etag of a node from its id and tree modification time.
pub fn calculate_etag(id: &str, tmtime: &DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(format_time(tmtime).as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("\"{}\"", &hex[..32])
}

/// One file, directory or space root.
#[derive(Clone)]
pub struct Node {
    /// Space the node belongs to.
    pub space_id: String,
    /// Node id.
    pub id: String,
    /// Parent node id, empty for space roots.
    pub parent_id: String,
    /// Name inside the parent.
    pub name: String,
    /// Blob holding the content of a file.
    pub blob_id: String,
    /// Size of the blob.
    pub blobsize: i64,
    /// Kind of the node.
    pub kind: NodeKind,
    /// False for a resolved path that has no node yet.
    pub exists: bool,
    /// Owner of the space the node lives in.
    pub owner: Option<UserId>,
    lu: Arc<Lookup>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("space_id", &self.space_id)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("exists", &self.exists)
            .finish()
    }
}

impl Node {
    /// Creates a node value. Nothing is written.
    pub fn new(
        lu: &Arc<Lookup>,
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
        kind: NodeKind,
        owner: Option<UserId>,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            id: id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            blob_id: String::new(),
            blobsize: 0,
            kind,
            exists: false,
            owner,
            lu: lu.clone(),
        }
    }

    /// Reads a node from its metadata.
    ///
    /// A missing space root or node yields `exists == false`. Nodes in a
    /// disabled space are `NotFound` unless `can_list_disabled` is set.
    pub fn read(lu: &Arc<Lookup>, space_id: &str, node_id: &str, can_list_disabled: bool) -> FsResult<Node> {
        let backend = lu.metadata_backend();
        let root_path = lu.internal_path(space_id, space_id);
        let root_attrs = match backend.all(&root_path) {
            Ok(a) => a,
            Err(FsError::NotFound(_)) => {
                let kind = if node_id == space_id { NodeKind::SpaceRoot } else { NodeKind::File };
                return Ok(Node::new(lu, space_id, node_id, "", "", kind, None));
            }
            Err(e) => return Err(e),
        };
        let owner = root_attrs
            .string(attrs::OWNER_ID)
            .filter(|o| !o.is_empty())
            .map(UserId::new);

        if !can_list_disabled && root_attrs.contains(attrs::DTIME) {
            return Err(FsError::NotFound(format!("space {} is disabled", space_id)));
        }

        if node_id == space_id {
            return Ok(Node::from_attrs(lu, space_id, node_id, &root_attrs, owner));
        }

        let path = lu.internal_path(space_id, node_id);
        let node_attrs = match backend.all(&path) {
            Ok(a) => a,
            Err(FsError::NotFound(_)) => {
                return Ok(Node::new(lu, space_id, node_id, "", "", NodeKind::File, owner));
            }
            Err(e) => return Err(e),
        };
        if node_attrs.string(attrs::PARENT_ID).unwrap_or_default().is_empty() {
            return Err(FsError::Internal(format!(
                "missing parent id on node {}!{}",
                space_id, node_id
            )));
        }
        Ok(Node::from_attrs(lu, space_id, node_id, &node_attrs, owner))
    }

    fn from_attrs(lu: &Arc<Lookup>, space_id: &str, node_id: &str, a: &Attributes, owner: Option<UserId>) -> Node {
        let kind = if node_id == space_id {
            NodeKind::SpaceRoot
        } else if a.int64(attrs::TYPE) == Some(NodeKind::Directory.as_i64()) {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        Node {
            space_id: space_id.to_string(),
            id: node_id.to_string(),
            parent_id: a.string(attrs::PARENT_ID).unwrap_or_default(),
            name: a.string(attrs::NAME).unwrap_or_default(),
            blob_id: a.string(attrs::BLOB_ID).unwrap_or_default(),
            blobsize: a.int64(attrs::BLOB_SIZE).unwrap_or(0),
            kind,
            exists: true,
            owner,
            lu: lu.clone(),
        }
    }

    /// The lookup this node was resolved through.
    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lu
    }

    /// Resource id of the node.
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.space_id, &self.id)
    }

    /// Internal path of the node.
    pub fn internal_path(&self) -> PathBuf {
        self.lu.internal_path(&self.space_id, &self.id)
    }

    /// Internal path of the parent node.
    pub fn parent_path(&self) -> PathBuf {
        self.lu.internal_path(&self.space_id, &self.parent_id)
    }

    /// Path of the child entry in the parent directory.
    pub fn entry_path(&self) -> PathBuf {
        self.parent_path().join(&self.name)
    }

    /// Path of the lock file.
    pub fn lock_file_path(&self) -> PathBuf {
        let mut p = self.internal_path().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    /// Returns true for the root of a space.
    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    /// Returns true for directories and space roots.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Resolves the child `name`. A missing child has `exists == false`.
    pub fn child(&self, name: &str) -> FsResult<Node> {
        match self.lu.node_id_from_parent_and_name(self, name)? {
            Some(id) => {
                let mut c = Node::read(&self.lu, &self.space_id, &id, true)?;
                if !c.exists {
                    // dangling entry, the node was removed underneath us
                    c.parent_id = self.id.clone();
                    c.name = name.to_string();
                }
                Ok(c)
            }
            None => Ok(Node::new(
                &self.lu,
                &self.space_id,
                uuid::Uuid::new_v4().to_string(),
                &self.id,
                name,
                NodeKind::File,
                self.owner.clone(),
            )),
        }
    }

    /// Reads the parent node.
    pub fn parent(&self) -> FsResult<Node> {
        if self.parent_id.is_empty() {
            return Err(FsError::Internal(format!("node {} has no parent", self.resource_id())));
        }
        let p = Node::read(&self.lu, &self.space_id, &self.parent_id, true)?;
        if !p.exists {
            return Err(FsError::NotFound(format!("parent {} of {}", self.parent_id, self.id)));
        }
        Ok(p)
    }

    /// Reads the root of the node's space, disabled or not.
    pub fn space_root(&self) -> FsResult<Node> {
        Node::read(&self.lu, &self.space_id, &self.space_id, true)
    }

    /// Reads every attribute of the node.
    pub fn xattrs(&self) -> FsResult<Attributes> {
        self.lu.metadata_backend().all(&self.internal_path())
    }

    /// Reads one attribute as a string.
    pub fn xattr_string(&self, key: &str) -> FsResult<String> {
        self.lu.metadata_backend().get_string(&self.internal_path(), key)
    }

    /// Reads one attribute as an integer.
    pub fn xattr_int64(&self, key: &str) -> FsResult<i64> {
        self.lu.metadata_backend().get_int64(&self.internal_path(), key)
    }

    /// Merges attributes into the node's set.
    pub fn set_xattrs(&self, a: Attributes, acquire_lock: bool) -> FsResult<()> {
        self.lu
            .metadata_backend()
            .set_multiple(&self.internal_path(), a, acquire_lock)
    }

    /// Sets one string attribute.
    pub fn set_xattr_string(&self, key: &str, value: &str) -> FsResult<()> {
        self.lu
            .metadata_backend()
            .set(&self.internal_path(), key, value.as_bytes().to_vec())
    }

    /// Removes one attribute.
    pub fn remove_xattr(&self, key: &str, acquire_lock: bool) -> FsResult<()> {
        self.lu
            .metadata_backend()
            .remove(&self.internal_path(), key, acquire_lock)
    }

    /// Returns true if the directory takes part in propagation.
    pub fn has_propagation(&self) -> bool {
        matches!(self.xattr_string(attrs::PROPAGATION).as_deref(), Ok("1"))
    }

    /// Aggregate size of the subtree below a directory.
    pub fn tree_size(&self) -> FsResult<u64> {
        let ts = self.xattr_int64(attrs::TREE_SIZE)?;
        Ok(ts.max(0) as u64)
    }

    /// Sets the aggregate size.
    pub fn set_tree_size(&self, size: u64) -> FsResult<()> {
        self.set_xattr_string(attrs::TREE_SIZE, &size.to_string())
    }

    /// Size as reported to callers: tree size for directories, blob size
    /// for files.
    pub fn size(&self) -> FsResult<u64> {
        if self.is_dir() {
            match self.tree_size() {
                Ok(s) => Ok(s),
                Err(e) if e.is_attr_unset() => Ok(0),
                Err(e) => Err(e),
            }
        } else {
            Ok(self.blobsize.max(0) as u64)
        }
    }

    /// Modification time. Falls back to the on-disk time when unset.
    pub fn mtime(&self) -> FsResult<DateTime<Utc>> {
        match self.xattr_string(attrs::MTIME) {
            Ok(s) => parse_time(&s),
            Err(e) if e.is_attr_unset() || e.is_not_found() => {
                let md = fs::metadata(self.internal_path())?;
                Ok(DateTime::<Utc>::from(md.modified()?))
            }
            Err(e) => Err(e),
        }
    }

    /// Sets or clears the modification time.
    pub fn set_mtime(&self, t: Option<&DateTime<Utc>>) -> FsResult<()> {
        match t {
            Some(t) => self.set_xattr_string(attrs::MTIME, &format_time(t)),
            None => self.remove_xattr(attrs::MTIME, true),
        }
    }

    /// Tree modification time, falling back to the modification time.
    pub fn tmtime(&self) -> FsResult<DateTime<Utc>> {
        match self.xattr_string(attrs::TMTIME) {
            Ok(s) => parse_time(&s),
            Err(e) if e.is_attr_unset() => self.mtime(),
            Err(e) => Err(e),
        }
    }

    /// Sets or clears the tree modification time.
    pub fn set_tmtime(&self, t: Option<&DateTime<Utc>>) -> FsResult<()> {
        match t {
            Some(t) => self.set_xattr_string(attrs::TMTIME, &format_time(t)),
            None => self.remove_xattr(attrs::TMTIME, true),
        }
    }

    /// Disable time of a space root.
    pub fn dtime(&self) -> FsResult<DateTime<Utc>> {
        parse_time(&self.xattr_string(attrs::DTIME)?)
    }

    /// Sets or clears the disable time.
    pub fn set_dtime(&self, t: Option<&DateTime<Utc>>) -> FsResult<()> {
        match t {
            Some(t) => self.set_xattr_string(attrs::DTIME, &format_time(t)),
            None => self.remove_xattr(attrs::DTIME, true),
        }
    }

    /// Returns true if the node's space is disabled.
    pub fn is_disabled(&self) -> bool {
        match self.space_root() {
            Ok(root) => root.dtime().is_ok(),
            Err(_) => false,
        }
    }

    /// Etag derived from id and tree modification time.
    pub fn etag(&self) -> FsResult<String> {
        Ok(calculate_etag(&self.id, &self.tmtime()?))
    }

    /// Stored checksum of the given algorithm, hex encoded.
    pub fn checksum(&self, algo: &str) -> Option<String> {
        self.xattr_string(&format!("{}{}", attrs::CHECKSUM_PREFIX, algo)).ok()
    }

    /// Returns true while an upload session owns the node.
    pub fn is_processing(&self) -> bool {
        matches!(self.xattr_string(attrs::STATUS), Ok(v) if v.starts_with(attrs::PROCESSING_STATUS))
    }

    /// Id of the latest upload session that touched the node.
    pub fn processing_id(&self) -> FsResult<String> {
        let v = self.xattr_string(attrs::STATUS)?;
        Ok(v.trim_start_matches(attrs::PROCESSING_STATUS).to_string())
    }

    /// Removes the processing status, unless a later session owns the node.
    pub fn unmark_processing(&self, session_id: &str) -> FsResult<()> {
        let _lock = self.lu.metadata_backend().lock(&self.internal_path());
        let current = self.xattr_string(attrs::STATUS).unwrap_or_default();
        if current != format!("{}{}", attrs::PROCESSING_STATUS, session_id) {
            debug!(node_id = %self.id, session = session_id, "node owned by another session, keeping status");
            return Ok(());
        }
        self.remove_xattr(attrs::STATUS, false)
    }

    /// Records the result of a virus scan.
    pub fn set_scan_data(&self, info: &str, date: &DateTime<Utc>) -> FsResult<()> {
        let mut a = Attributes::new();
        a.set_string(attrs::SCAN_STATUS, info);
        a.set_string(attrs::SCAN_DATE, &format_time(date));
        self.set_xattrs(a, true)
    }

    /// Result of the last virus scan, if any.
    pub fn scan_data(&self) -> Option<(String, DateTime<Utc>)> {
        let date = parse_time(&self.xattr_string(attrs::SCAN_DATE).ok()?).ok()?;
        let status = self.xattr_string(attrs::SCAN_STATUS).ok()?;
        Some((status, date))
    }

    /// Owner of the space, or the first manager for spaces owned by
    /// themselves.
    pub fn space_owner_or_manager(&self) -> Option<UserId> {
        if let Some(owner) = &self.owner {
            if owner.as_str() != self.space_id {
                return Some(owner.clone());
            }
        }
        let root = self.space_root().ok()?;
        root.list_grants()
            .ok()?
            .into_iter()
            .find_map(|g| match g.grantee {
                Grantee::User(u) if g.permissions.is_manager() => Some(u),
                _ => None,
            })
    }

    /// Attribute names of every grant on the node.
    pub fn list_grantees(&self) -> FsResult<Vec<String>> {
        let a = match self.xattrs() {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(a.with_prefix(attrs::GRANT_PREFIX).map(|(k, _)| k.clone()).collect())
    }

    /// Reads the grant stored under `key`.
    pub fn read_grant(&self, key: &str) -> FsResult<Grant> {
        let raw = self.lu.metadata_backend().get(&self.internal_path(), key)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Every readable grant on the node. Unreadable grants are logged and
    /// skipped.
    pub fn list_grants(&self) -> FsResult<Vec<Grant>> {
        let a = match self.xattrs() {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut grants = Vec::new();
        for (key, raw) in a.with_prefix(attrs::GRANT_PREFIX) {
            match serde_json::from_slice::<Grant>(raw) {
                Ok(g) => grants.push(g),
                Err(e) => error!(
                    space_id = %self.space_id,
                    node_id = %self.id,
                    grantee = %key,
                    error = %e,
                    "error reading grant"
                ),
            }
        }
        Ok(grants)
    }

    /// Removes the grant of `grantee`.
    pub fn delete_grant(&self, grantee: &Grantee, acquire_lock: bool) -> FsResult<()> {
        let key = format!("{}{}", attrs::GRANT_PREFIX, grantee.principal());
        self.remove_xattr(&key, acquire_lock)
    }

    /// Returns true if a deny grant on this node names `user`. Nodes whose
    /// grants cannot be read count as denied.
    pub fn is_denied(&self, user: &User) -> bool {
        match self.list_grants() {
            Ok(grants) => grants
                .iter()
                .any(|g| g.grantee.matches(user) && g.is_deny()),
            Err(_) => true,
        }
    }

    /// Permissions granted to `user` on this node alone.
    ///
    /// Returns the union of unexpired user and group grants and whether one
    /// of them denies access.
    pub fn read_user_permissions(&self, user: &User) -> FsResult<(PermissionSet, bool)> {
        if self.owner.as_ref() == Some(&user.id) {
            return Ok((PermissionSet::owner(), false));
        }
        let mut ap = PermissionSet::NONE;
        for g in self.list_grants()? {
            if !g.grantee.matches(user) || g.is_expired() {
                continue;
            }
            if g.is_deny() {
                return Ok((PermissionSet::NONE, true));
            }
            ap |= g.permissions;
        }
        Ok((ap, false))
    }

    /// Reads the lock of the node, if any.
    pub fn lock(&self) -> Option<Lock> {
        self.read_lock().ok()
    }

    /// Removes the node, its metadata and its entry in the parent.
    pub fn purge(&self) -> FsResult<()> {
        let path = self.internal_path();
        let removed = if self.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.lu.metadata_backend().purge(&path)?;
        if !self.parent_id.is_empty() {
            let entry = self.entry_path();
            self.lu.uncache(&entry);
            match fs::remove_file(&entry) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Builds the caller-facing description of the node.
    pub fn as_resource_info(&self, permissions: PermissionSet, path: String) -> FsResult<ResourceInfo> {
        let quota = if self.is_space_root() {
            self.xattr_string(attrs::QUOTA).ok()
        } else {
            None
        };
        Ok(ResourceInfo {
            id: self.resource_id(),
            parent_id: (!self.parent_id.is_empty())
                .then(|| ResourceId::new(&self.space_id, &self.parent_id)),
            name: self.name.clone(),
            path,
            kind: self.kind,
            size: self.size()?,
            mtime: self.mtime()?,
            etag: self.etag()?,
            owner: self.owner.clone(),
            permissions,
            checksum: self.checksum("blake3"),
            scan: self.scan_data(),
            processing: self.is_processing(),
            lock: self.lock(),
            quota,
        })
    }
}

/// Metadata of a node as returned to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Id of the node.
    pub id: ResourceId,
    /// Id of the parent, absent for space roots.
    pub parent_id: Option<ResourceId>,
    /// Name inside the parent.
    pub name: String,
    /// Path relative to the space root, as far as the caller may see it.
    pub path: String,
    /// Kind of the node.
    pub kind: NodeKind,
    /// Tree size for directories, blob size for files.
    pub size: u64,
    /// Modification time.
    pub mtime: DateTime<Utc>,
    /// Current etag.
    pub etag: String,
    /// Owner of the space.
    pub owner: Option<UserId>,
    /// Effective permissions of the caller.
    pub permissions: PermissionSet,
    /// Blake3 checksum of the content.
    pub checksum: Option<String>,
    /// Last virus scan result and date.
    pub scan: Option<(String, DateTime<Utc>)>,
    /// True while an upload session owns the node.
    pub processing: bool,
    /// Current lock.
    pub lock: Option<Lock>,
    /// Raw quota attribute, only on space roots.
    pub quota: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryBackend;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Lookup>) {
        let dir = TempDir::new().unwrap();
        let lu = Arc::new(Lookup::new(dir.path(), Arc::new(MemoryBackend::new())));
        (dir, lu)
    }

    fn write_root(lu: &Arc<Lookup>, space: &str, owner: &str) {
        let path = lu.internal_path(space, space);
        fs::create_dir_all(&path).unwrap();
        let mut a = Attributes::new();
        a.set_string(attrs::ID, space);
        a.set_string(attrs::OWNER_ID, owner);
        a.set_int64(attrs::TYPE, 2);
        a.set_string(attrs::TREE_SIZE, "0");
        lu.metadata_backend().set_multiple(&path, a, true).unwrap();
    }

    #[test]
    fn test_read_missing_space_yields_absent_node() {
        let (_dir, lu) = setup();
        let n = Node::read(&lu, "nope", "nope", false).unwrap();
        assert!(!n.exists);
        assert_eq!(n.kind, NodeKind::SpaceRoot);
    }

    #[test]
    fn test_read_space_root() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let n = Node::read(&lu, "s1", "s1", false).unwrap();
        assert!(n.exists);
        assert!(n.is_space_root());
        assert_eq!(n.owner, Some(UserId::new("alice")));
        assert_eq!(n.tree_size().unwrap(), 0);
    }

    #[test]
    fn test_disabled_space_is_hidden() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let root = Node::read(&lu, "s1", "s1", false).unwrap();
        root.set_dtime(Some(&Utc::now())).unwrap();
        assert!(Node::read(&lu, "s1", "s1", false).unwrap_err().is_not_found());
        let n = Node::read(&lu, "s1", "s1", true).unwrap();
        assert!(n.is_disabled());
    }

    #[test]
    fn test_node_without_parent_is_internal_error() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        lu.metadata_backend()
            .set(&lu.internal_path("s1", "n1"), attrs::NAME, b"x".to_vec())
            .unwrap();
        match Node::read(&lu, "s1", "n1", false) {
            Err(FsError::Internal(_)) => {}
            other => panic!("expected Internal, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_child_keeps_parent_and_name() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let root = Node::read(&lu, "s1", "s1", false).unwrap();
        let c = root.child("missing.txt").unwrap();
        assert!(!c.exists);
        assert_eq!(c.parent_id, "s1");
        assert_eq!(c.name, "missing.txt");
    }

    #[test]
    fn test_etag_changes_with_tmtime() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);
        let a = calculate_etag("n", &t1);
        assert_eq!(a, calculate_etag("n", &t1));
        assert_ne!(a, calculate_etag("n", &t2));
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn test_unmark_processing_only_for_owning_session() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let root = Node::read(&lu, "s1", "s1", false).unwrap();
        root.set_xattr_string(attrs::STATUS, "processing:b").unwrap();
        assert!(root.is_processing());
        root.unmark_processing("a").unwrap();
        assert_eq!(root.processing_id().unwrap(), "b");
        root.unmark_processing("b").unwrap();
        assert!(!root.is_processing());
    }

    #[test]
    fn test_unmark_processing_waits_for_metadata_lock() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let root = Node::read(&lu, "s1", "s1", false).unwrap();
        root.set_xattr_string(attrs::STATUS, "processing:a").unwrap();

        let path = root.internal_path();
        let guard = lu.metadata_backend().lock(&path);
        let stale = root.clone();
        let cleanup = std::thread::spawn(move || stale.unmark_processing("a"));
        std::thread::sleep(std::time::Duration::from_millis(50));
        // a newer upload takes the node while the cleanup waits
        let mut a = Attributes::new();
        a.set_string(attrs::STATUS, "processing:b");
        lu.metadata_backend().set_multiple(&path, a, false).unwrap();
        drop(guard);

        cleanup.join().unwrap().unwrap();
        assert_eq!(root.processing_id().unwrap(), "b");
    }

    #[test]
    fn test_scan_data() {
        let (_dir, lu) = setup();
        write_root(&lu, "s1", "alice");
        let root = Node::read(&lu, "s1", "s1", false).unwrap();
        assert!(root.scan_data().is_none());
        let now = Utc::now();
        root.set_scan_data("clean", &now).unwrap();
        assert_eq!(root.scan_data(), Some(("clean".to_string(), now)));
    }
}
