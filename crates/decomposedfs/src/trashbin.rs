//! Soft deletion.
//!
//! Deleted nodes stay in their space until they are restored or purged.
//! The [`Trashbin`] trait is the seam the facade delegates to;
//! [`DecomposedTrashbin`] keeps trashed nodes in place on disk, see
//! [`Tree::delete`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{FsError, FsResult};
use crate::fs::Decomposedfs;
use crate::node::{Node, NodeKind};
use crate::permissions::{authorize, PermissionSet, Permissions};
use crate::tree::Tree;
use crate::types::{OpContext, Reference};

/// One entry of a trash listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecycleItem {
    /// Node id of the top level trashed item.
    pub key: String,
    /// Path below the top level item, empty for the item itself.
    pub path: String,
    /// Id of the node.
    pub node_id: String,
    /// Path the node had before it was deleted.
    pub origin: String,
    /// Kind of the node.
    pub kind: NodeKind,
    /// Blob size of files, tree size of directories.
    pub size: u64,
    /// When the top level item was deleted.
    pub deletion_time: DateTime<Utc>,
}

/// Trash of the spaces.
pub trait Trashbin: Send + Sync {
    /// Lists the top level items of a space's trash, or with a `key` the
    /// children of a trashed directory at `rel_path` below it.
    fn list_recycle(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<Vec<RecycleItem>>;

    /// Restores an item to `restore_to`, or to where it was deleted from.
    fn restore_recycle_item(
        &self,
        ctx: &OpContext,
        space: &Reference,
        key: &str,
        rel_path: &str,
        restore_to: Option<&Reference>,
    ) -> FsResult<()>;

    /// Permanently removes an item and its blobs.
    fn purge_recycle_item(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<()>;

    /// Permanently removes every item of a space's trash.
    fn empty_recycle(&self, ctx: &OpContext, space: &Reference) -> FsResult<()>;
}

/// Trashbin keeping deleted nodes inside their space.
pub struct DecomposedTrashbin {
    tree: Arc<Tree>,
    permissions: Permissions,
}

impl DecomposedTrashbin {
    /// Creates a trashbin working on `tree`.
    pub fn new(tree: Arc<Tree>, permissions: Permissions) -> Self {
        Self { tree, permissions }
    }

    /// Reads the space root and checks `required` against the caller's
    /// permissions on it. Trashed nodes carry no grants of their own.
    fn authorize_space(&self, ctx: &OpContext, space: &Reference, required: PermissionSet) -> FsResult<Node> {
        let space_id = space.space_id()?;
        let root = Node::read(self.tree.lookup(), space_id, space_id, true)?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }
        let perms = self.permissions.assemble_permissions(&ctx.user, &root)?;
        authorize(perms, required, &space.to_string())?;
        Ok(root)
    }
}

impl Trashbin for DecomposedTrashbin {
    fn list_recycle(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<Vec<RecycleItem>> {
        let root = self.authorize_space(ctx, space, PermissionSet::LIST_RECYCLE)?;

        if key.is_empty() {
            let mut items = Vec::new();
            for (key, _) in self.tree.trash_keys(&root.space_id)? {
                match self.tree.recycle_item(&root.space_id, &key, "") {
                    Ok(item) => items.push(item),
                    Err(e) => error!(space_id = %root.space_id, key = %key, error = %e, "skipping unreadable trash item"),
                }
            }
            return Ok(items);
        }

        let item = self.tree.recycle_item(&root.space_id, key, rel_path)?;
        if item.kind.is_dir() {
            self.tree.list_trashed_children(&root.space_id, key, rel_path)
        } else {
            Ok(vec![item])
        }
    }

    fn restore_recycle_item(
        &self,
        ctx: &OpContext,
        space: &Reference,
        key: &str,
        rel_path: &str,
        restore_to: Option<&Reference>,
    ) -> FsResult<()> {
        let root = self.authorize_space(ctx, space, PermissionSet::RESTORE_RECYCLE_ITEM)?;
        let trashed = self.tree.read_recycle_item(&root.space_id, key, rel_path)?;

        let target_ref = match restore_to {
            Some(r) => r.clone(),
            None => Reference::space_path(&root.space_id, trashed.origin.clone()),
        };
        let lu = self.tree.lookup();
        let target = lu.node_from_resource(&target_ref)?;
        if target.space_id != root.space_id {
            return Err(FsError::BadRequest("cannot restore into another space".to_string()));
        }

        let parent = target.parent()?;
        let perms = self.permissions.assemble_permissions(&ctx.user, &parent)?;
        authorize(perms, PermissionSet::INITIATE_FILE_UPLOAD, &target_ref.to_string())?;

        let restored = self.tree.restore_recycle_item(&trashed, &target)?;
        info!(space_id = %root.space_id, key, node_id = %restored.id, target = %target_ref, "restored trash item");
        Ok(())
    }

    fn purge_recycle_item(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<()> {
        let root = self.authorize_space(ctx, space, PermissionSet::PURGE_RECYCLE)?;
        let trashed = self.tree.read_recycle_item(&root.space_id, key, rel_path)?;
        self.tree.purge_recycle_item(&trashed)?;
        debug!(space_id = %root.space_id, key, path = rel_path, "purged trash item");
        Ok(())
    }

    fn empty_recycle(&self, ctx: &OpContext, space: &Reference) -> FsResult<()> {
        let root = self.authorize_space(ctx, space, PermissionSet::PURGE_RECYCLE)?;
        let mut first_err = None;
        for (key, _) in self.tree.trash_keys(&root.space_id)? {
            let purged = self
                .tree
                .read_recycle_item(&root.space_id, &key, "")
                .and_then(|t| self.tree.purge_recycle_item(&t));
            if let Err(e) = purged {
                error!(space_id = %root.space_id, key = %key, error = %e, "could not purge trash item");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Decomposedfs {
    /// Lists a space's trash. See [`Trashbin::list_recycle`].
    pub fn list_recycle(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<Vec<RecycleItem>> {
        let _enter = ctx.span().enter();
        self.trashbin.list_recycle(ctx, space, key, rel_path)
    }

    /// Restores a trash item.
    pub fn restore_recycle_item(
        &self,
        ctx: &OpContext,
        space: &Reference,
        key: &str,
        rel_path: &str,
        restore_to: Option<&Reference>,
    ) -> FsResult<()> {
        let _enter = ctx.span().enter();
        self.trashbin
            .restore_recycle_item(ctx, space, key, rel_path, restore_to)
    }

    /// Purges a trash item.
    pub fn purge_recycle_item(&self, ctx: &OpContext, space: &Reference, key: &str, rel_path: &str) -> FsResult<()> {
        let _enter = ctx.span().enter();
        self.trashbin.purge_recycle_item(ctx, space, key, rel_path)
    }

    /// Purges every item of a space's trash.
    pub fn empty_recycle(&self, ctx: &OpContext, space: &Reference) -> FsResult<()> {
        let _enter = ctx.span().enter();
        self.trashbin.empty_recycle(ctx, space)
    }
}
