//! Reference resolution and the on-disk layout.
//!
//! Lookup is the only place that knows how ids map to paths. Node paths are
//! sharded by id prefix:
//!
//! ```text
//! <root>/spaces/<2 chars of space id>/<rest>/nodes/<aa>/<bb>/<cc>/<dd>/<rest of node id>
//! ```
//!
//! A directory node is a directory on disk whose entries are small files
//! named after the children and holding the child's node id.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::error::{FsError, FsResult};
use crate::metadata::MetadataBackend;
use crate::node::Node;
use crate::types::{Reference, ResourceId, SpaceType, User};

/// Splits the first `depth` segments of `width` characters off `id`.
///
/// `pathify("aabbccdd", 3, 1)` returns `"a/a/b/bccdd"`. Ids too short for
/// the requested depth keep the remainder as the last segment.
pub fn pathify(id: &str, depth: usize, width: usize) -> String {
    let mut out = String::with_capacity(id.len() + depth);
    let mut i = 0;
    while i < depth {
        let start = i * width;
        let end = start + width;
        if id.len() <= end || !id.is_char_boundary(start) || !id.is_char_boundary(end) {
            break;
        }
        out.push_str(&id[start..end]);
        out.push('/');
        i += 1;
    }
    out.push_str(&id[i * width..]);
    out
}

/// Resolves references to nodes and owns the path conventions.
pub struct Lookup {
    root: PathBuf,
    backend: Arc<dyn MetadataBackend>,
    id_cache: DashMap<PathBuf, String>,
}

impl Lookup {
    /// Creates a lookup for the storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn MetadataBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
            id_cache: DashMap::new(),
        }
    }

    /// The metadata backend used for all nodes.
    pub fn metadata_backend(&self) -> &Arc<dyn MetadataBackend> {
        &self.backend
    }

    /// The storage root.
    pub fn internal_root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything that belongs to one space.
    pub fn space_path(&self, space_id: &str) -> PathBuf {
        self.root.join("spaces").join(pathify(space_id, 1, 2))
    }

    /// Internal path of a node.
    pub fn internal_path(&self, space_id: &str, node_id: &str) -> PathBuf {
        self.space_path(space_id)
            .join("nodes")
            .join(pathify(node_id, 4, 2))
    }

    /// Directory holding the trash entries of a space.
    pub fn trash_path(&self, space_id: &str) -> PathBuf {
        self.space_path(space_id).join("trash")
    }

    /// Directory holding the upload sessions.
    pub fn uploads_path(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Directory holding the space indexes.
    pub fn indexes_path(&self) -> PathBuf {
        self.root.join("indexes")
    }

    /// Generates the id of a new space.
    ///
    /// Personal spaces are keyed by their owner so a user has at most one.
    pub fn generate_space_id(&self, space_type: SpaceType, owner: &User) -> String {
        match space_type {
            SpaceType::Personal => owner.id.as_str().to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Resolves a reference to a node.
    ///
    /// A missing leaf yields a node with `exists == false`; a missing
    /// intermediate path segment is `NotFound`.
    pub fn node_from_resource(self: &Arc<Self>, reference: &Reference) -> FsResult<Node> {
        let id = reference
            .resource_id
            .as_ref()
            .ok_or_else(|| FsError::BadRequest(format!("invalid reference {}", reference)))?;
        let node = self.node_from_id(id)?;

        let p = reference.path.trim();
        if p.is_empty() || p == "." || p == "/" {
            return Ok(node);
        }
        let mut n = self.walk_path(node, p, &mut |_| Ok(()))?;
        n.space_id = id.space_id.clone();
        Ok(n)
    }

    /// Resolves a resource id. An empty node id addresses the space root.
    pub fn node_from_id(self: &Arc<Self>, id: &ResourceId) -> FsResult<Node> {
        if id.space_id.is_empty() {
            return Err(FsError::BadRequest(format!("invalid resource id {}", id)));
        }
        if id.node_id.is_empty() {
            return self.node_from_space_id(&id.space_id);
        }
        Node::read(self, &id.space_id, &id.node_id, false)
    }

    /// Reads the root node of a space.
    pub fn node_from_space_id(self: &Arc<Self>, space_id: &str) -> FsResult<Node> {
        Node::read(self, space_id, space_id, false)
    }

    /// Calls [`Node::child`] for every segment of `path`, starting at `root`.
    ///
    /// `f` runs for every visited node except `root`.
    pub fn walk_path(
        self: &Arc<Self>,
        root: Node,
        path: &str,
        f: &mut dyn FnMut(&Node) -> FsResult<()>,
    ) -> FsResult<Node> {
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        let mut current = root;
        for (i, segment) in segments.iter().enumerate() {
            if *segment == ".." {
                return Err(FsError::BadRequest(format!("invalid path {}", path)));
            }
            current = current.child(segment)?;
            if !current.exists && i < segments.len() - 1 {
                return Err(FsError::NotFound(segment.to_string()));
            }
            f(&current)?;
        }
        Ok(current)
    }

    /// Builds the caller-facing path of `node`.
    ///
    /// Walks up until the space root, or until `has_permission` rejects an
    /// ancestor, so callers never see names above what they may access.
    pub fn path(&self, node: &Node, has_permission: &dyn Fn(&Node) -> bool) -> FsResult<String> {
        let mut segments: Vec<String> = Vec::new();
        let mut current = node.clone();
        while current.id != current.space_id {
            segments.push(current.name.clone());
            let parent = match current.parent() {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        space_id = %current.space_id,
                        node_id = %current.id,
                        parent_id = %current.parent_id,
                        error = %e,
                        "could not read parent while building path"
                    );
                    return Err(e);
                }
            };
            if !has_permission(&parent) {
                break;
            }
            current = parent;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Returns the id of the child `name` of `parent`, if any.
    pub fn node_id_from_parent_and_name(&self, parent: &Node, name: &str) -> FsResult<Option<String>> {
        let entry = parent.internal_path().join(name);
        if let Some(id) = self.id_cache.get(&entry) {
            return Ok(Some(id.clone()));
        }
        match fs::read_to_string(&entry) {
            Ok(id) => {
                let id = id.trim().to_string();
                self.id_cache.insert(entry, id.clone());
                Ok(Some(id))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            // the parent is a file, so it has no children
            Err(e) if e.kind() == ErrorKind::NotADirectory => Ok(None),
            Err(e) => Err(FsError::metadata("read child", &entry, e)),
        }
    }

    /// Remembers the node id behind a child entry.
    pub fn cache_id(&self, entry: PathBuf, node_id: &str) {
        self.id_cache.insert(entry, node_id.to_string());
    }

    /// Forgets a child entry, called whenever an entry is moved or removed.
    pub fn uncache(&self, entry: &Path) {
        if self.id_cache.remove(entry).is_some() {
            debug!(entry = %entry.display(), "dropped id cache entry");
        }
    }
}
