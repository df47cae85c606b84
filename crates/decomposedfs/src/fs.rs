//! The decomposed filesystem facade.
//!
//! [`Decomposedfs`] wires lookup, tree, permissions, indexes, upload
//! sessions and the trashbin together and exposes the operations a storage
//! provider serves. Every operation takes an [`OpContext`] naming the actor
//! and runs inside its span. Spaces, grants, uploads and the trash add
//! further operations in their own modules.

use std::io::{self, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::attrs;
use crate::blobstore::FsBlobstore;
use crate::config::{MetadataBackendKind, Options};
use crate::error::{FsError, FsResult};
use crate::events::EventPublisher;
use crate::index::SpaceIndexes;
use crate::locks::Lock;
use crate::lookup::Lookup;
use crate::metadata::{MemoryBackend, MetadataBackend};
use crate::node::{Node, ResourceInfo};
use crate::parallel::parallel_map;
use crate::permissions::{authorize, PermissionSet, Permissions, PermissionsClient, UserDirectory};
use crate::quota::{self, QuotaUsage};
use crate::sidecar::SidecarBackend;
use crate::spaces::{render_template, CreateSpaceRequest, StorageSpace};
use crate::trashbin::{DecomposedTrashbin, Trashbin};
use crate::tree::Tree;
use crate::types::{OpContext, Reference, ResourceId, SpaceType};
use crate::upload::SessionStore;

/// A decomposed filesystem instance.
pub struct Decomposedfs {
    pub(crate) options: Options,
    pub(crate) lu: Arc<Lookup>,
    pub(crate) tree: Arc<Tree>,
    pub(crate) permissions: Permissions,
    pub(crate) users: Arc<dyn UserDirectory>,
    pub(crate) indexes: SpaceIndexes,
    pub(crate) sessions: SessionStore,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) trashbin: Arc<dyn Trashbin>,
}

impl Decomposedfs {
    /// Opens the filesystem rooted at `options.root`, creating the top level
    /// directories if needed.
    pub fn new(
        options: Options,
        permissions: Arc<dyn PermissionsClient>,
        users: Arc<dyn UserDirectory>,
        events: Arc<dyn EventPublisher>,
    ) -> FsResult<Self> {
        options
            .validate()
            .map_err(|e| FsError::BadRequest(format!("invalid options: {:#}", e)))?;

        let backend: Arc<dyn MetadataBackend> = match options.metadata_backend {
            MetadataBackendKind::File => Arc::new(SidecarBackend::new()),
            MetadataBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        let lu = Arc::new(Lookup::new(options.root.clone(), backend));
        let blobstore = Arc::new(FsBlobstore::new(options.root.clone()));
        let tree = Arc::new(Tree::new(lu.clone(), blobstore, options.max_concurrency));
        tree.setup()?;

        let permissions = Permissions::new(permissions);
        let trashbin: Arc<dyn Trashbin> = Arc::new(DecomposedTrashbin::new(tree.clone(), permissions.clone()));

        info!(
            root = %options.root.display(),
            backend = lu.metadata_backend().name(),
            async_uploads = options.async_uploads,
            "opened decomposedfs"
        );
        Ok(Self {
            indexes: SpaceIndexes::open(&lu.indexes_path()),
            sessions: SessionStore::new(lu.uploads_path()),
            options,
            lu,
            tree,
            permissions,
            users,
            events,
            trashbin,
        })
    }

    /// The options the instance was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The lookup resolving references of this instance.
    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lu
    }

    /// The store of upload sessions, e.g. for reconciliation sweeps.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Resolves `reference` to an existing node.
    fn existing_node(&self, reference: &Reference) -> FsResult<Node> {
        let n = self.lu.node_from_resource(reference)?;
        if !n.exists {
            return Err(FsError::NotFound(reference.to_string()));
        }
        Ok(n)
    }

    /// Resolves `reference` and checks `required` against the caller's
    /// permissions on it.
    fn authorized_node(&self, ctx: &OpContext, reference: &Reference, required: PermissionSet) -> FsResult<(Node, PermissionSet)> {
        let n = self.existing_node(reference)?;
        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        authorize(rp, required, &reference.to_string())?;
        Ok((n, rp))
    }

    /// Path of `n` as far up as the caller may resolve paths.
    fn visible_path(&self, ctx: &OpContext, n: &Node) -> FsResult<String> {
        self.lu.path(n, &|p: &Node| {
            self.permissions
                .assemble_permissions(&ctx.user, p)
                .map_or(false, |rp| rp.contains(PermissionSet::GET_PATH))
        })
    }

    /// Creates the caller's personal space.
    pub fn create_home(&self, ctx: &OpContext) -> FsResult<StorageSpace> {
        let _enter = ctx.span().enter();
        self.home_layout(ctx)?;
        let req = CreateSpaceRequest::new(SpaceType::Personal, ctx.user.username.clone()).with_owner(ctx.user.id.clone());
        self.create_storage_space(ctx, req)
    }

    /// Returns the caller's personal space.
    pub fn get_home(&self, ctx: &OpContext) -> FsResult<StorageSpace> {
        let _enter = ctx.span().enter();
        let layout = self.home_layout(ctx)?;
        let space_id = self.lu.generate_space_id(SpaceType::Personal, &ctx.user);
        let root = Node::read(&self.lu, &space_id, &space_id, false)?;
        if !root.exists {
            return Err(FsError::NotFound(format!("home {}", layout)));
        }
        self.storage_space_from_node(ctx, &root, true)
    }

    fn home_layout(&self, ctx: &OpContext) -> FsResult<String> {
        if self.options.user_layout.trim().is_empty() {
            return Err(FsError::BadRequest("home support is disabled".to_string()));
        }
        Ok(render_template(
            &self.options.user_layout,
            &ctx.user,
            SpaceType::Personal,
            "",
            ctx.user.id.as_str(),
        ))
    }

    /// Returns the path of a node relative to its space root, cut off at
    /// the first ancestor the caller may not resolve.
    pub fn get_path_by_id(&self, ctx: &OpContext, id: &ResourceId) -> FsResult<String> {
        let _enter = ctx.span().enter();
        let n = self.lu.node_from_id(id)?;
        if !n.exists {
            return Err(FsError::NotFound(id.to_string()));
        }
        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        authorize(rp, PermissionSet::GET_PATH, &id.to_string())?;
        self.visible_path(ctx, &n)
    }

    /// Returns the metadata of a node.
    pub fn get_md(&self, ctx: &OpContext, reference: &Reference) -> FsResult<ResourceInfo> {
        let _enter = ctx.span().enter();
        let (n, rp) = self.authorized_node(ctx, reference, PermissionSet::STAT)?;
        let path = self.visible_path(ctx, &n)?;
        n.as_resource_info(rp, path)
    }

    /// Lists the children of a directory.
    pub fn list_folder(&self, ctx: &OpContext, reference: &Reference) -> FsResult<Vec<ResourceInfo>> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::LIST_CONTAINER)?;
        if !n.is_dir() {
            return Err(FsError::BadRequest(format!("{} is not a container", reference)));
        }
        let base = self.visible_path(ctx, &n)?;
        let children = self.tree.list_folder(&n, Some(&ctx.user))?;

        let workers = self.options.max_concurrency.min(children.len());
        parallel_map(children, workers, |child| {
            let rp = self.permissions.assemble_permissions(&ctx.user, &child)?;
            let path = format!("{}/{}", base.trim_end_matches('/'), child.name);
            child.as_resource_info(rp, path)
        })
    }

    /// Creates a directory. The last path segment of `reference` names it.
    pub fn create_dir(&self, ctx: &OpContext, reference: &Reference) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let name = reference.path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        if name.is_empty() || name == "." {
            return Err(FsError::BadRequest(format!("invalid name for {}", reference)));
        }

        let mut n = match self.lu.node_from_resource(reference) {
            Ok(n) => n,
            Err(FsError::NotFound(p)) => {
                return Err(FsError::PreconditionFailed(format!("parent of {} does not exist", p)))
            }
            Err(e) => return Err(e),
        };
        if n.exists {
            return Err(FsError::AlreadyExists(reference.to_string()));
        }
        let parent = n.parent().map_err(|e| match e {
            FsError::NotFound(p) => FsError::PreconditionFailed(format!("parent {} does not exist", p)),
            other => other,
        })?;

        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        authorize(rp, PermissionSet::CREATE_CONTAINER, &reference.to_string())?;
        parent.check_lock(ctx)?;

        self.tree.create_dir(&mut n)?;
        debug!(space_id = %n.space_id, node_id = %n.id, name = %n.name, "created directory");
        Ok(())
    }

    /// Creates an empty file, or with `mark_processing` flags an existing
    /// one as being processed.
    pub fn touch_file(
        &self,
        ctx: &OpContext,
        reference: &Reference,
        mark_processing: bool,
        mtime: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let mut n = self.lu.node_from_resource(reference)?;
        if n.parent_id.is_empty() {
            return Err(FsError::BadRequest(format!("cannot touch {}", reference)));
        }
        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        authorize(rp, PermissionSet::INITIATE_FILE_UPLOAD, &reference.to_string())?;
        if n.exists {
            n.check_lock(ctx)?;
        }
        self.tree.touch_file(&mut n, mark_processing, mtime)
    }

    /// Moves or renames a node. The target must not exist.
    pub fn move_node(&self, ctx: &OpContext, old_ref: &Reference, new_ref: &Reference) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let (old, _) = self.authorized_node(ctx, old_ref, PermissionSet::MOVE)?;
        if old.is_space_root() {
            return Err(FsError::BadRequest("cannot move a space root".to_string()));
        }

        let new = self.lu.node_from_resource(new_ref)?;
        if new.exists {
            return Err(FsError::AlreadyExists(new_ref.to_string()));
        }
        if new.parent_id.is_empty() {
            return Err(FsError::BadRequest(format!("invalid target {}", new_ref)));
        }
        let required = if old.is_dir() {
            PermissionSet::CREATE_CONTAINER
        } else {
            PermissionSet::INITIATE_FILE_UPLOAD
        };
        let tp = self.permissions.assemble_permissions(&ctx.user, &new)?;
        authorize(tp, required, &new_ref.to_string())?;
        old.check_lock(ctx)?;

        if old.is_dir() {
            let mut current = new.parent()?;
            loop {
                if current.id == old.id {
                    return Err(FsError::BadRequest("cannot move a folder into itself".to_string()));
                }
                if current.is_space_root() || current.parent_id.is_empty() {
                    break;
                }
                current = current.parent()?;
            }
        }

        self.tree.move_node(&old, &new)?;
        debug!(space_id = %old.space_id, node_id = %old.id, from = %old_ref, to = %new_ref, "moved node");
        Ok(())
    }

    /// Moves a node into the trash.
    pub fn delete(&self, ctx: &OpContext, reference: &Reference) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::DELETE)?;
        if n.is_space_root() {
            return Err(FsError::BadRequest("space roots are removed with delete_storage_space".to_string()));
        }
        n.check_lock(ctx)?;
        self.tree.delete(&n)
    }

    /// Opens the content of a file.
    pub fn download(&self, ctx: &OpContext, reference: &Reference) -> FsResult<(ResourceInfo, Box<dyn Read + Send>)> {
        let _enter = ctx.span().enter();
        let (n, rp) = self.authorized_node(ctx, reference, PermissionSet::INITIATE_FILE_DOWNLOAD)?;
        if n.is_dir() {
            return Err(FsError::BadRequest(format!("{} is not a file", reference)));
        }
        let info = n.as_resource_info(rp, self.visible_path(ctx, &n)?)?;
        let reader: Box<dyn Read + Send> = if info.size == 0 {
            Box::new(io::empty())
        } else {
            self.tree.read_blob(&n)?
        };
        Ok((info, reader))
    }

    /// Returns the live lock of a node.
    pub fn get_lock(&self, ctx: &OpContext, reference: &Reference) -> FsResult<Lock> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::INITIATE_FILE_DOWNLOAD)?;
        n.read_lock()
    }

    /// Locks a node.
    pub fn set_lock(&self, ctx: &OpContext, reference: &Reference, lock: &Lock) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::INITIATE_FILE_UPLOAD)?;
        n.set_lock(lock)
    }

    /// Replaces the lock `existing_lock_id` of a node with `lock`.
    pub fn refresh_lock(&self, ctx: &OpContext, reference: &Reference, lock: &Lock, existing_lock_id: &str) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::INITIATE_FILE_UPLOAD)?;
        n.refresh_lock(ctx, lock, existing_lock_id)
    }

    /// Removes the lock of a node.
    pub fn unlock(&self, ctx: &OpContext, reference: &Reference, lock: &Lock) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let (n, _) = self.authorized_node(ctx, reference, PermissionSet::INITIATE_FILE_UPLOAD)?;
        n.unlock(ctx, lock)
    }

    /// Returns the quota figures of the space the reference points into.
    pub fn get_quota(&self, ctx: &OpContext, reference: &Reference) -> FsResult<QuotaUsage> {
        let _enter = ctx.span().enter();
        let n = self.existing_node(reference)?;
        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        if !rp.contains(PermissionSet::GET_QUOTA) && !self.permissions.client().list_all_spaces(&ctx.user) {
            authorize(rp, PermissionSet::GET_QUOTA, &reference.to_string())?;
        }
        let root = if n.is_space_root() { n } else { n.space_root()? };
        let raw = root.xattr_string(attrs::QUOTA).ok();
        quota::usage(raw.as_deref(), root.tree_size().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingPublisher;
    use crate::permissions::{AdminPolicy, StaticUserDirectory};
    use crate::types::User;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Decomposedfs {
        let mut options = Options::with_root(dir.path());
        options.async_uploads = false;
        Decomposedfs::new(
            options,
            Arc::new(AdminPolicy::new(["admin"])),
            Arc::new(StaticUserDirectory::default()),
            Arc::new(RecordingPublisher::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_options_rejected() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::with_root(dir.path());
        options.max_concurrency = 0;
        let res = Decomposedfs::new(
            options,
            Arc::new(AdminPolicy::default()),
            Arc::new(StaticUserDirectory::default()),
            Arc::new(RecordingPublisher::new()),
        );
        match res {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_home_lifecycle() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));

        match fs.get_home(&alice) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        let home = fs.create_home(&alice).unwrap();
        assert_eq!(home.root, ResourceId::new("alice", "alice"));
        assert_eq!(home.alias.as_deref(), Some("personal/alice"));
        assert_eq!(fs.get_home(&alice).unwrap().id, home.id);

        match fs.create_home(&alice) {
            Err(FsError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[test]
    fn test_home_disabled_without_layout() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::with_root(dir.path());
        options.user_layout = String::new();
        let fs = Decomposedfs::new(
            options,
            Arc::new(AdminPolicy::default()),
            Arc::new(StaticUserDirectory::default()),
            Arc::new(RecordingPublisher::new()),
        )
        .unwrap();
        match fs.create_home(&OpContext::new(User::new("alice"))) {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_create_list_and_stat() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();

        fs.create_dir(&alice, &Reference::space_path("alice", "/docs")).unwrap();
        fs.touch_file(&alice, &Reference::space_path("alice", "/docs/a.txt"), false, None)
            .unwrap();

        let entries = fs.list_folder(&alice, &Reference::space_path("alice", "/docs")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].path, "/docs/a.txt");

        let md = fs.get_md(&alice, &Reference::space_path("alice", "/docs")).unwrap();
        assert!(md.kind.is_dir());
        assert_eq!(md.path, "/docs");
        assert_eq!(
            fs.get_path_by_id(&alice, &entries[0].id).unwrap(),
            "/docs/a.txt"
        );
    }

    #[test]
    fn test_create_dir_errors() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();

        match fs.create_dir(&alice, &Reference::space_path("alice", "/")) {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other),
        }
        match fs.create_dir(&alice, &Reference::space_path("alice", "/missing/child")) {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
        fs.create_dir(&alice, &Reference::space_path("alice", "/d")).unwrap();
        match fs.create_dir(&alice, &Reference::space_path("alice", "/d")) {
            Err(FsError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[test]
    fn test_strangers_see_nothing() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        let bob = OpContext::new(User::new("bob"));
        fs.create_home(&alice).unwrap();
        fs.create_dir(&alice, &Reference::space_path("alice", "/d")).unwrap();

        match fs.get_md(&bob, &Reference::space_path("alice", "/d")) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        match fs.delete(&bob, &Reference::space_path("alice", "/d")) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_move_rules() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();
        let r = |p: &str| Reference::space_path("alice", p);
        fs.create_dir(&alice, &r("/a")).unwrap();
        fs.create_dir(&alice, &r("/a/b")).unwrap();
        fs.create_dir(&alice, &r("/c")).unwrap();

        match fs.move_node(&alice, &r("/a"), &r("/a/b/a")) {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other),
        }
        match fs.move_node(&alice, &r("/a"), &r("/c")) {
            Err(FsError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
        match fs.move_node(&alice, &r("/nope"), &r("/x")) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        fs.move_node(&alice, &r("/a"), &r("/c/a")).unwrap();
        assert!(fs.get_md(&alice, &r("/c/a/b")).is_ok());
    }

    #[test]
    fn test_locks_guard_delete() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();
        let file = Reference::space_path("alice", "/f.txt");
        fs.touch_file(&alice, &file, false, None).unwrap();

        let lock = Lock::new("l-1", alice.user.id.clone());
        fs.set_lock(&alice, &file, &lock).unwrap();
        assert_eq!(fs.get_lock(&alice, &file).unwrap().lock_id, "l-1");

        match fs.delete(&alice, &file) {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
        let holder = alice.clone().with_lock_id("l-1");
        fs.unlock(&holder, &file, &lock).unwrap();
        fs.delete(&alice, &file).unwrap();
    }

    #[test]
    fn test_download_empty_file() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();
        let file = Reference::space_path("alice", "/empty");
        fs.touch_file(&alice, &file, false, None).unwrap();

        let (info, mut reader) = fs.download(&alice, &file).unwrap();
        assert_eq!(info.size, 0);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());

        match fs.download(&alice, &Reference::space_root("alice")) {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[test]
    fn test_get_quota_unlimited() {
        let dir = TempDir::new().unwrap();
        let fs = open(&dir);
        let alice = OpContext::new(User::new("alice"));
        fs.create_home(&alice).unwrap();
        let q = fs.get_quota(&alice, &Reference::space_root("alice")).unwrap();
        assert_eq!(q.total, 0);
        assert_eq!(q.used, 0);
        assert_eq!(q.remaining, u64::MAX);
    }
}
