//! Structural operations on the node tree.
//!
//! The tree links nodes into their parents, moves them, routes deletions
//! into the trash and keeps the aggregate tree size and tree modification
//! time of every ancestor current through [`Tree::propagate`].

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::attrs;
use crate::blobstore::Blobstore;
use crate::error::{FsError, FsResult};
use crate::lookup::{pathify, Lookup};
use crate::metadata::{Attributes, MetadataLock};
use crate::node::{Node, NodeKind};
use crate::parallel::parallel_map;
use crate::quota;
use crate::trashbin::RecycleItem;
use crate::types::{format_time, parse_time, User};

/// Separates a node id from the deletion time in trashed node paths.
pub const TRASH_ID_DELIMITER: &str = ".T.";
/// Separates a node id from the modification time in revision paths.
pub const REVISION_ID_DELIMITER: &str = ".REV.";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(suffix);
    PathBuf::from(p)
}

fn remove_item(path: &Path) -> io::Result<()> {
    let res = match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match res {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A node found in the trash.
#[derive(Debug, Clone)]
pub struct TrashedNode {
    /// The node, with the attributes it had when it was deleted.
    pub node: Node,
    /// Path the node currently occupies on disk.
    pub deleted_path: PathBuf,
    /// Path of the trash entry of the top level item.
    pub trash_entry: PathBuf,
    /// Entry of the node inside its trashed parent, for items below the
    /// top level.
    pub parent_entry: Option<PathBuf>,
    /// Path the node had before it was deleted.
    pub origin: String,
    /// When the top level item was deleted.
    pub deletion_time: DateTime<Utc>,
}

/// Structural tree operations.
pub struct Tree {
    lu: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
    max_concurrency: usize,
}

impl Tree {
    /// Creates a tree on top of `lu` storing content in `blobstore`.
    pub fn new(lu: Arc<Lookup>, blobstore: Arc<dyn Blobstore>, max_concurrency: usize) -> Self {
        Self {
            lu,
            blobstore,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// The lookup the tree resolves nodes with.
    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lu
    }

    /// Creates the top level directories.
    pub fn setup(&self) -> FsResult<()> {
        for dir in [self.lu.internal_root().join("spaces"), self.lu.uploads_path()] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Writes the child entry `name -> node_id` into the directory at
    /// `parent_path`. Without `replace` an existing entry is `AlreadyExists`.
    fn link_child(&self, parent_path: &Path, name: &str, node_id: &str, replace: bool) -> FsResult<()> {
        let entry = parent_path.join(name);
        if replace {
            let tmp = with_suffix(&entry, &format!(".{}.tmp", uuid::Uuid::new_v4()));
            fs::write(&tmp, node_id.as_bytes())?;
            if let Err(e) = fs::rename(&tmp, &entry) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        } else {
            let mut f = match OpenOptions::new().write(true).create_new(true).open(&entry) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(FsError::AlreadyExists(name.to_string()))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(FsError::PreconditionFailed(format!("parent of {} does not exist", name)))
                }
                Err(e) => return Err(e.into()),
            };
            f.write_all(node_id.as_bytes())?;
        }
        self.lu.cache_id(entry, node_id);
        Ok(())
    }

    fn node_metadata(n: &Node) -> Attributes {
        let mut a = Attributes::new();
        a.set_string(attrs::ID, &n.id);
        a.set_string(attrs::PARENT_ID, &n.parent_id);
        a.set_string(attrs::NAME, &n.name);
        a.set_int64(attrs::TYPE, n.kind.as_i64());
        if !n.is_dir() {
            a.set_string(attrs::BLOB_ID, &n.blob_id);
            a.set_int64(attrs::BLOB_SIZE, n.blobsize);
        }
        a
    }

    /// Creates a directory node and links it into its parent.
    pub fn create_dir(&self, n: &mut Node) -> FsResult<()> {
        if n.exists {
            return Err(FsError::AlreadyExists(n.name.clone()));
        }
        n.kind = NodeKind::Directory;
        let path = n.internal_path();
        fs::create_dir_all(&path)?;

        let mut a = Self::node_metadata(n);
        a.set_string(attrs::TREE_SIZE, "0");
        a.set_string(attrs::PROPAGATION, "1");
        a.set_string(attrs::MTIME, &format_time(&Utc::now()));
        n.set_xattrs(a, true)?;

        if let Err(e) = self.link_child(&n.parent_path(), &n.name, &n.id, false) {
            if let Err(re) = fs::remove_dir_all(&path) {
                debug!(path = %path.display(), error = %re, "cannot delete node");
            }
            let _ = self.lu.metadata_backend().purge(&path);
            return Err(e);
        }
        n.exists = true;
        self.propagate(n, 0)
    }

    /// Creates an empty file node. An existing node is only accepted when
    /// `mark_processing` is set, in which case it gets the processing status.
    pub fn touch_file(&self, n: &mut Node, mark_processing: bool, mtime: Option<DateTime<Utc>>) -> FsResult<()> {
        if n.exists {
            if mark_processing {
                return n.set_xattr_string(attrs::STATUS, attrs::PROCESSING_STATUS);
            }
            return Err(FsError::AlreadyExists(n.name.clone()));
        }
        n.kind = NodeKind::File;
        let path = n.internal_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::File::create(&path)?;

        let mut a = Self::node_metadata(n);
        if mark_processing {
            a.set_string(attrs::STATUS, attrs::PROCESSING_STATUS);
        }
        a.set_string(attrs::MTIME, &format_time(&mtime.unwrap_or_else(Utc::now)));
        n.set_xattrs(a, true)?;

        self.link_child(&n.parent_path(), &n.name, &n.id, true)?;
        n.exists = true;
        self.propagate(n, 0)
    }

    /// Creates the on-disk file of a node receiving an upload and links it
    /// into its parent.
    ///
    /// Returns the node's metadata lock, which the caller holds while it
    /// writes the initial attributes.
    pub fn init_new_node(&self, n: &Node, space_root: &Node, fsize: u64) -> FsResult<MetadataLock> {
        let path = n.internal_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let lock = self.lu.metadata_backend().lock(&path);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists(n.name.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        let used = space_root.tree_size().unwrap_or(0);
        let q = space_root.xattr_string(attrs::QUOTA).ok();
        if let Err(e) = quota::check(q.as_deref(), used, false, 0, fsize) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        info!(space_id = %n.space_id, node_id = %n.id, name = %n.name, "linking new node");
        if let Err(e) = self.link_child(&n.parent_path(), &n.name, &n.id, false) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(lock)
    }

    /// Moves or renames a node inside its space. The target must not exist.
    pub fn move_node(&self, old: &Node, new: &Node) -> FsResult<()> {
        if old.space_id != new.space_id {
            return Err(FsError::BadRequest("cannot move across spaces".to_string()));
        }
        if new.exists {
            return Err(FsError::AlreadyExists(format!("{}/{}", new.parent_id, new.name)));
        }

        let old_entry = old.entry_path();
        self.lu.uncache(&old_entry);

        if old.parent_id == new.parent_id {
            let new_entry = old.parent_path().join(&new.name);
            fs::rename(&old_entry, &new_entry)?;
            self.lu.cache_id(new_entry, &old.id);
            old.set_xattr_string(attrs::NAME, &new.name)?;
            return self.propagate(new, 0);
        }

        let new_entry = new.entry_path();
        fs::rename(&old_entry, &new_entry)?;
        self.lu.cache_id(new_entry, &old.id);

        let mut a = Attributes::new();
        a.set_string(attrs::PARENT_ID, &new.parent_id);
        a.set_string(attrs::NAME, &new.name);
        old.set_xattrs(a, true)?;

        let size = old.size()? as i64;
        self.propagate(old, -size)?;
        self.propagate(new, size)
    }

    /// Lists the children of a directory node.
    ///
    /// Children carrying a deny grant for `user` are left out.
    pub fn list_folder(&self, n: &Node, user: Option<&User>) -> FsResult<Vec<Node>> {
        let dir = n.internal_path();
        let names: Vec<String> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FsError::NotFound(n.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let workers = self.max_concurrency.min(names.len());
        let children = parallel_map(names, workers, |name| {
            let Some(id) = self.lu.node_id_from_parent_and_name(n, &name)? else {
                return Ok(None);
            };
            let child = Node::read(&self.lu, &n.space_id, &id, true)?;
            if !child.exists {
                warn!(space_id = %n.space_id, parent_id = %n.id, name = %name, node_id = %id, "dangling child entry");
                return Ok(None);
            }
            if let Some(u) = user {
                if child.is_denied(u) {
                    return Ok(None);
                }
            }
            Ok(Some(child))
        })?;
        Ok(children.into_iter().flatten().collect())
    }

    /// Moves a node into the trash of its space.
    pub fn delete(&self, n: &Node) -> FsResult<()> {
        let entry = n.entry_path();
        let origin = self.lu.path(n, &|_| true)?;
        n.set_xattr_string(attrs::TRASH_ORIGIN, &origin)?;

        let size_diff = -(n.size()? as i64);
        let deletion_time = format_time(&Utc::now());

        let trash_entry = self.lu.trash_path(&n.space_id).join(pathify(&n.id, 4, 2));
        let undo_origin = || {
            let _ = n.remove_xattr(attrs::TRASH_ORIGIN, true);
        };
        if let Some(dir) = trash_entry.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                undo_origin();
                return Err(e.into());
            }
        }
        if let Err(e) = fs::write(&trash_entry, deletion_time.as_bytes()) {
            undo_origin();
            return Err(e.into());
        }

        let node_path = n.internal_path();
        let trash_path = with_suffix(&node_path, &format!("{}{}", TRASH_ID_DELIMITER, deletion_time));
        if let Err(e) = fs::rename(&node_path, &trash_path) {
            undo_origin();
            let _ = fs::remove_file(&trash_entry);
            return Err(e.into());
        }
        if let Err(e) = self.lu.metadata_backend().rename(&node_path, &trash_path) {
            let _ = fs::rename(&trash_path, &node_path);
            undo_origin();
            let _ = fs::remove_file(&trash_entry);
            return Err(e);
        }

        // a trashed node keeps no lock
        let _ = fs::remove_file(n.lock_file_path());

        self.lu.uncache(&entry);
        fs::remove_file(&entry)?;

        debug!(space_id = %n.space_id, node_id = %n.id, origin = %origin, "moved node to trash");
        self.propagate(n, size_diff)
    }

    /// Adds `size_delta` to the tree size of every ancestor of `n` that
    /// takes part in propagation and refreshes its tree modification time.
    ///
    /// Each ancestor is updated under its own metadata lock. The walk stops
    /// at the first ancestor without the propagation marker or after the
    /// space root.
    pub fn propagate(&self, n: &Node, size_delta: i64) -> FsResult<()> {
        if n.is_space_root() || n.parent_id.is_empty() {
            return Ok(());
        }
        let backend = self.lu.metadata_backend();
        let now = format_time(&Utc::now());
        let mut current = n.parent_id.clone();
        loop {
            let path = self.lu.internal_path(&n.space_id, &current);
            let _lock = backend.lock(&path);
            let mut a = match backend.all(&path) {
                Ok(a) => a,
                Err(e) if e.is_not_found() => {
                    warn!(space_id = %n.space_id, node_id = %current, "ancestor vanished during propagation");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if a.string(attrs::PROPAGATION).as_deref() != Some("1") {
                debug!(space_id = %n.space_id, node_id = %current, "propagation stops at unmarked node");
                return Ok(());
            }
            if size_delta != 0 {
                let ts = a.int64(attrs::TREE_SIZE).unwrap_or(0);
                let updated = ts.saturating_add(size_delta).max(0);
                a.set_int64(attrs::TREE_SIZE, updated);
            }
            a.set_string(attrs::TMTIME, &now);
            let next = a.string(attrs::PARENT_ID).unwrap_or_default();
            backend.write_all(&path, a)?;

            if current == n.space_id || next.is_empty() {
                return Ok(());
            }
            current = next;
        }
    }

    /// Stores the content of `source` as the node's blob.
    pub fn write_blob(&self, n: &Node, source: &Path) -> FsResult<()> {
        self.blobstore.upload(n, source)
    }

    /// Opens the node's blob. Nodes without a blob read as empty.
    pub fn read_blob(&self, n: &Node) -> FsResult<Box<dyn Read + Send>> {
        if n.blob_id.is_empty() {
            return Ok(Box::new(io::empty()));
        }
        self.blobstore.download(n)
    }

    /// Deletes the node's blob.
    pub fn delete_blob(&self, n: &Node) -> FsResult<()> {
        if n.blob_id.is_empty() {
            return Err(FsError::Internal("could not delete blob, node has no blob id".to_string()));
        }
        self.blobstore.delete(n)
    }

    /// Removes a node occupying `path`, its whole subtree, its blobs and
    /// its revisions.
    pub fn remove_node(&self, path: &Path, n: &Node) -> FsResult<()> {
        if n.is_dir() {
            match fs::read_dir(path) {
                Ok(entries) => {
                    for entry in entries {
                        let entry = entry?;
                        let child_id = fs::read_to_string(entry.path())?;
                        let child = Node::read(&self.lu, &n.space_id, child_id.trim(), true)?;
                        if child.exists {
                            self.remove_node(&child.internal_path(), &child)?;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "error listing folder");
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = remove_item(path) {
            error!(path = %path.display(), error = %e, "error purging node");
            return Err(e.into());
        }
        self.lu.metadata_backend().purge(path)?;
        let _ = fs::remove_file(n.lock_file_path());

        if !n.blob_id.is_empty() {
            self.delete_blob(n)?;
        }

        for rev in self.revisions(n)? {
            let blob_id = self
                .lu
                .metadata_backend()
                .get_string(&rev, attrs::BLOB_ID)
                .unwrap_or_default();
            remove_item(&rev)?;
            self.lu.metadata_backend().purge(&rev)?;
            if !blob_id.is_empty() {
                let mut r = n.clone();
                r.blob_id = blob_id;
                self.delete_blob(&r)?;
            }
        }
        Ok(())
    }

    /// Internal paths of the revisions of `n`.
    pub fn revisions(&self, n: &Node) -> FsResult<Vec<PathBuf>> {
        let path = n.internal_path();
        let (Some(dir), Some(base)) = (path.parent(), path.file_name()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}{}", base.to_string_lossy(), REVISION_ID_DELIMITER);
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut revs = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && !name.contains(".meta") && !name.ends_with(".tmp") {
                revs.push(dir.join(name));
            }
        }
        Ok(revs)
    }

    /// Keys and deletion times of the top level items in a space's trash.
    pub fn trash_keys(&self, space_id: &str) -> FsResult<Vec<(String, DateTime<Utc>)>> {
        fn walk(dir: &Path, prefix: &str, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
            let entries = match fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", prefix, name);
                if entry.file_type()?.is_dir() {
                    walk(&entry.path(), &key, out)?;
                } else {
                    out.push((key, entry.path()));
                }
            }
            Ok(())
        }
        let mut files = Vec::new();
        walk(&self.lu.trash_path(space_id), "", &mut files)?;
        let mut keys = Vec::with_capacity(files.len());
        for (key, path) in files {
            let raw = fs::read_to_string(&path)?;
            match parse_time(raw.trim()) {
                Ok(t) => keys.push((key, t)),
                Err(e) => warn!(space_id, key = %key, error = %e, "skipping malformed trash entry"),
            }
        }
        Ok(keys)
    }

    /// Resolves a trash item. `path` addresses an item below a trashed
    /// directory, relative to it.
    pub fn read_recycle_item(&self, space_id: &str, key: &str, path: &str) -> FsResult<TrashedNode> {
        if key.is_empty() {
            return Err(FsError::BadRequest("key is empty".to_string()));
        }
        let trash_entry = self.lu.trash_path(space_id).join(pathify(key, 4, 2));
        let raw = match fs::read_to_string(&trash_entry) {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("trash item {}", key)))
            }
            Err(e) => return Err(e.into()),
        };
        let deletion_time = parse_time(raw.trim())?;
        let top_path = with_suffix(
            &self.lu.internal_path(space_id, key),
            &format!("{}{}", TRASH_ID_DELIMITER, raw.trim()),
        );

        let mut node_id = key.to_string();
        let mut deleted_path = top_path.clone();
        let mut parent_entry = None;
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                return Err(FsError::BadRequest(format!("invalid trash path {}", path)));
            }
            let entry = deleted_path.join(segment);
            node_id = match fs::read_to_string(&entry) {
                Ok(id) => id.trim().to_string(),
                Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::NotADirectory => {
                    return Err(FsError::NotFound(format!("trash item {}/{}", key, path)))
                }
                Err(e) => return Err(e.into()),
            };
            deleted_path = self.lu.internal_path(space_id, &node_id);
            parent_entry = Some(entry);
        }

        let backend = self.lu.metadata_backend();
        let a = backend.all(&deleted_path)?;
        let kind = if a.int64(attrs::TYPE) == Some(NodeKind::Directory.as_i64()) {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let mut node = Node::new(
            &self.lu,
            space_id,
            node_id,
            a.string(attrs::PARENT_ID).unwrap_or_default(),
            a.string(attrs::NAME).unwrap_or_default(),
            kind,
            None,
        );
        node.blob_id = a.string(attrs::BLOB_ID).unwrap_or_default();
        node.blobsize = a.int64(attrs::BLOB_SIZE).unwrap_or(0);
        node.exists = true;

        let origin = match backend.get_string(&top_path, attrs::TRASH_ORIGIN) {
            Ok(o) => join_path(&o, path),
            Err(e) => {
                error!(space_id, key, error = %e, "could not read origin path, restoring to /");
                "/".to_string()
            }
        };

        Ok(TrashedNode {
            node,
            deleted_path,
            trash_entry,
            parent_entry,
            origin,
            deletion_time,
        })
    }

    fn trashed_size(&self, t: &TrashedNode) -> u64 {
        if t.node.is_dir() {
            self.lu
                .metadata_backend()
                .get_int64(&t.deleted_path, attrs::TREE_SIZE)
                .unwrap_or(0)
                .max(0) as u64
        } else {
            t.node.blobsize.max(0) as u64
        }
    }

    /// Describes a trash item.
    pub fn recycle_item(&self, space_id: &str, key: &str, path: &str) -> FsResult<RecycleItem> {
        let t = self.read_recycle_item(space_id, key, path)?;
        Ok(RecycleItem {
            key: key.to_string(),
            path: path.trim_matches('/').to_string(),
            node_id: t.node.id.clone(),
            origin: t.origin.clone(),
            kind: t.node.kind,
            size: self.trashed_size(&t),
            deletion_time: t.deletion_time,
        })
    }

    /// Lists the children of a trashed directory.
    pub fn list_trashed_children(&self, space_id: &str, key: &str, path: &str) -> FsResult<Vec<RecycleItem>> {
        let t = self.read_recycle_item(space_id, key, path)?;
        if !t.node.is_dir() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for entry in fs::read_dir(&t.deleted_path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let sub = join_path(path, &name);
            items.push(self.recycle_item(space_id, key, sub.trim_start_matches('/'))?);
        }
        Ok(items)
    }

    /// Restores a trash item to `target`, which must not exist yet.
    pub fn restore_recycle_item(&self, trashed: &TrashedNode, target: &Node) -> FsResult<Node> {
        if target.exists {
            return Err(FsError::AlreadyExists("origin already exists".to_string()));
        }
        let mut restored = trashed.node.clone();
        self.link_child(&target.parent_path(), &target.name, &restored.id, false)?;

        let node_path = restored.internal_path();
        if trashed.deleted_path != node_path {
            fs::rename(&trashed.deleted_path, &node_path)?;
            self.lu
                .metadata_backend()
                .rename(&trashed.deleted_path, &node_path)?;
        }

        restored.parent_id = target.parent_id.clone();
        restored.name = target.name.clone();
        restored.owner = target.owner.clone();
        let mut a = Attributes::new();
        a.set_string(attrs::NAME, &restored.name);
        a.set_string(attrs::PARENT_ID, &restored.parent_id);
        restored.set_xattrs(a, true)?;
        restored.remove_xattr(attrs::TRASH_ORIGIN, true)?;

        match &trashed.parent_entry {
            Some(entry) => remove_item(entry)?,
            None => remove_item(&trashed.trash_entry)?,
        }

        let size = restored.size()? as i64;
        self.propagate(&restored, size)?;
        Ok(restored)
    }

    /// Permanently removes a trash item with its subtree and blobs.
    pub fn purge_recycle_item(&self, trashed: &TrashedNode) -> FsResult<()> {
        self.remove_node(&trashed.deleted_path, &trashed.node)?;
        match &trashed.parent_entry {
            Some(entry) => remove_item(entry)?,
            None => remove_item(&trashed.trash_entry)?,
        }
        Ok(())
    }
}

fn join_path(base: &str, rel: &str) -> String {
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}
