//! Storage spaces.
//!
//! A space is a subtree rooted at a node whose id equals the space id. The
//! space indexes map users, groups and space types to space roots, so
//! listings never have to scan the spaces directory.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::attrs;
use crate::error::{FsError, FsResult};
use crate::fs::Decomposedfs;
use crate::grants::Grant;
use crate::metadata::Attributes;
use crate::node::{calculate_etag, Node, NodeKind, ResourceInfo};
use crate::parallel::parallel_map;
use crate::permissions::PermissionSet;
use crate::quota::{self, QuotaUsage};
use crate::types::{format_time, Grantee, GroupId, OpContext, Reference, ResourceId, SpaceType, User, UserId};

/// Upper bound on workers resolving space candidates.
const MAX_LIST_WORKERS: usize = 20;

/// Substitutes `{user.id}`, `{user.username}`, `{spacetype}`, `{spacename}`
/// and `{spaceid}` in a path or alias template. Space names are lowercased
/// with blanks turned into dashes.
pub(crate) fn render_template(tpl: &str, user: &User, space_type: SpaceType, space_name: &str, space_id: &str) -> String {
    let slug = space_name.trim().to_lowercase().replace(char::is_whitespace, "-");
    tpl.replace("{user.id}", user.id.as_str())
        .replace("{user.username}", &user.username)
        .replace("{spacetype}", space_type.as_str())
        .replace("{spacename}", &slug)
        .replace("{spaceid}", space_id)
}

/// Parameters of a new space.
#[derive(Debug, Clone)]
pub struct CreateSpaceRequest {
    /// Type of the space.
    pub space_type: SpaceType,
    /// Display name.
    pub name: String,
    /// Owner. Spaces without an owner are owned by themselves.
    pub owner: Option<UserId>,
    /// Quota in bytes.
    pub quota: Option<u64>,
    /// Description.
    pub description: Option<String>,
    /// Alias, rendered from the configured template when unset.
    pub alias: Option<String>,
    /// Space id to use instead of a generated one.
    pub space_id: Option<String>,
}

impl CreateSpaceRequest {
    /// A request with only type and name set.
    pub fn new(space_type: SpaceType, name: impl Into<String>) -> Self {
        Self {
            space_type,
            name: name.into(),
            owner: None,
            quota: None,
            description: None,
            alias: None,
            space_id: None,
        }
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Sets the quota.
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Uses a fixed space id.
    pub fn with_space_id(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }
}

/// Restricts a space listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceFilter {
    /// A space id, optionally followed by `!<node id>`.
    Id(String),
    /// Spaces of one type.
    Type(SpaceType),
    /// Spaces a user is a member of.
    User(UserId),
    /// Spaces a user owns.
    Owner(UserId),
}

/// Changes to a space. Unset fields stay as they are.
#[derive(Debug, Clone, Default)]
pub struct SpaceUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New quota, 0 for the configured maximum or unlimited.
    pub quota: Option<u64>,
    /// New description, may be empty.
    pub description: Option<String>,
    /// New alias.
    pub alias: Option<String>,
    /// Node id of the new space image.
    pub image: Option<String>,
    /// Node id of the new readme.
    pub readme: Option<String>,
}

/// A space as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpace {
    /// `<space id>!<root id>`.
    pub id: String,
    /// The root node.
    pub root: ResourceId,
    /// Display name.
    pub name: String,
    /// Type, absent on corrupt roots.
    pub space_type: Option<SpaceType>,
    /// Owner of the space.
    pub owner: Option<UserId>,
    /// Live grants keyed by grantee principal.
    pub grants: BTreeMap<String, PermissionSet>,
    /// Expiration of the grants that have one, keyed by principal.
    pub grant_expirations: BTreeMap<String, DateTime<Utc>>,
    /// Groups with a grant on the space.
    pub groups: BTreeSet<GroupId>,
    /// Tree modification time.
    pub mtime: Option<DateTime<Utc>>,
    /// Etag of the root.
    pub etag: String,
    /// Raw quota in bytes, if one is set.
    pub quota: Option<u64>,
    /// Quota figures.
    pub usage: QuotaUsage,
    /// Space image.
    pub image: Option<ResourceId>,
    /// Space readme.
    pub readme: Option<ResourceId>,
    /// Alias.
    pub alias: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// True for disabled spaces.
    pub trashed: bool,
    /// Metadata of the root node.
    pub root_info: Option<ResourceInfo>,
}

impl Decomposedfs {
    /// Creates a space and returns it.
    pub fn create_storage_space(&self, ctx: &OpContext, req: CreateSpaceRequest) -> FsResult<StorageSpace> {
        let _enter = ctx.span().enter();
        let owner_user = match &req.owner {
            Some(o) if o != &ctx.user.id => User::new(o.as_str()),
            _ => ctx.user.clone(),
        };
        let space_id = match &req.space_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.lu.generate_space_id(req.space_type, &owner_user),
        };

        if !self.permissions.client().create_space(&ctx.user) {
            return Err(FsError::PermissionDenied(space_id));
        }
        let root = Node::read(&self.lu, &space_id, &space_id, true)?;
        if root.exists {
            return Err(FsError::AlreadyExists(format!("space {} already exists", space_id)));
        }

        let quota = self.capped_quota(req.quota)?;
        let alias = match (&req.alias, req.space_type) {
            (_, SpaceType::Personal) => Some(render_template(
                &self.options.personal_space_alias_template,
                &owner_user,
                req.space_type,
                &req.name,
                &space_id,
            )),
            (Some(a), _) if !a.is_empty() => Some(a.clone()),
            _ => Some(render_template(
                &self.options.general_space_alias_template,
                &owner_user,
                req.space_type,
                &req.name,
                &space_id,
            )),
        }
        .filter(|a| !a.is_empty());

        fs::create_dir_all(root.internal_path())?;

        let owner = req
            .owner
            .clone()
            .or_else(|| (req.space_type == SpaceType::Personal).then(|| owner_user.id.clone()));
        let mut a = Attributes::new();
        a.set_string(attrs::ID, &space_id);
        a.set_string(attrs::SPACE_ID, &space_id);
        a.set_string(attrs::OWNER_ID, owner.as_ref().map_or(space_id.as_str(), |o| o.as_str()));
        a.set_int64(attrs::TYPE, NodeKind::SpaceRoot.as_i64());
        a.set_string(attrs::PROPAGATION, "1");
        a.set_string(attrs::NAME, &req.name);
        a.set_string(attrs::SPACE_NAME, &req.name);
        a.set_string(attrs::TREE_SIZE, "0");
        a.set_string(attrs::SPACE_TYPE, req.space_type.as_str());
        a.set_string(attrs::MTIME, &format_time(&Utc::now()));
        if let Some(q) = quota {
            a.set_string(attrs::QUOTA, &q.to_string());
        }
        if let Some(d) = req.description.as_deref().filter(|d| !d.is_empty()) {
            a.set_string(attrs::SPACE_DESCRIPTION, d);
        }
        if let Some(alias) = &alias {
            a.set_string(attrs::SPACE_ALIAS, alias);
        }
        root.set_xattrs(a, true)?;

        self.indexes
            .by_type
            .add(req.space_type.as_str(), &space_id, &space_id)?;
        if let Some(o) = &owner {
            self.indexes.by_user.add(o.as_str(), &space_id, &space_id)?;
        }

        let root = Node::read(&self.lu, &space_id, &space_id, true)?;
        if req.space_type != SpaceType::Personal {
            // the creator manages the new space
            let manager = Grant::new(Grantee::User(ctx.user.id.clone()), PermissionSet::manager())
                .with_creator(ctx.user.id.clone());
            let _lock = self.lu.metadata_backend().lock(&root.internal_path());
            self.store_grant(&root, &manager)?;
        }

        info!(space_id = %space_id, space_type = %req.space_type, "created space");
        self.storage_space_from_node(ctx, &root, false)
    }

    /// Validates a requested quota against the configured maximum. A
    /// missing or zero quota becomes the maximum, if there is one.
    fn capped_quota(&self, requested: Option<u64>) -> FsResult<Option<u64>> {
        let max = self.options.max_quota;
        match requested {
            Some(q) if max > 0 && q > max => Err(FsError::BadRequest(
                "requested quota is higher than allowed".to_string(),
            )),
            Some(0) | None if max > 0 => Ok(Some(max)),
            other => Ok(other),
        }
    }

    /// Lists the spaces matching `filters` that the caller may see.
    ///
    /// With `unrestricted` set, callers allowed to list all spaces skip the
    /// per space permission checks.
    pub fn list_storage_spaces(
        &self,
        ctx: &OpContext,
        filters: &[SpaceFilter],
        unrestricted: bool,
    ) -> FsResult<Vec<StorageSpace>> {
        let _enter = ctx.span().enter();
        let mut id_filter: Option<(String, String)> = None;
        let mut types: HashSet<SpaceType> = HashSet::new();
        let mut requested_user: Option<UserId> = None;
        for f in filters {
            match f {
                SpaceFilter::Type(t) => {
                    types.insert(*t);
                }
                SpaceFilter::Id(id) => {
                    let (space, node) = match id.split_once('!') {
                        Some((s, n)) => (s.to_string(), n.to_string()),
                        None => (id.clone(), id.clone()),
                    };
                    if node.contains('/') {
                        return Ok(Vec::new());
                    }
                    id_filter = Some((space, node));
                }
                SpaceFilter::User(u) | SpaceFilter::Owner(u) => requested_user = Some(u.clone()),
            }
        }
        let type_matches = |space: &StorageSpace| {
            types.is_empty() || space.space_type.map_or(false, |t| types.contains(&t))
        };

        let client = self.permissions.client();
        if let Some(u) = &requested_user {
            if !client.list_spaces_of_user(&ctx.user, u) {
                return Err(FsError::PermissionDenied(format!(
                    "user {} is not allowed to list spaces of other users",
                    ctx.user.id
                )));
            }
        }
        let check_permissions = !(unrestricted && client.list_all_spaces(&ctx.user));

        if let Some((space_id, node_id)) = &id_filter {
            let n = Node::read(&self.lu, space_id, node_id, true)?;
            if !n.exists {
                return Ok(Vec::new());
            }
            return match self.storage_space_from_node(ctx, &n, check_permissions) {
                Ok(space) if type_matches(&space) => Ok(vec![space]),
                Ok(_) | Err(FsError::NotFound(_)) | Err(FsError::PermissionDenied(_)) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let mut candidates: HashMap<String, String> = HashMap::new();
        if let Some(uid) = &requested_user {
            candidates.extend(self.indexes.by_user.load(uid.as_str())?);
            let user = if *uid == ctx.user.id {
                ctx.user.clone()
            } else {
                self.users.resolve(uid)?
            };
            for g in &user.groups {
                candidates.extend(self.indexes.by_group.load(g.as_str())?);
            }
        } else {
            let mut wanted: Vec<SpaceType> = if types.is_empty() {
                SpaceType::ALL.to_vec()
            } else {
                types.iter().copied().collect()
            };
            // share entries are keyed by the space holding them and must not
            // shadow that space's own root entry
            wanted.sort_by_key(|t| *t == SpaceType::Share);
            for t in wanted {
                for (space_id, node_id) in self.indexes.by_type.load(t.as_str())? {
                    candidates.entry(space_id).or_insert(node_id);
                }
            }
        }

        let shares = AtomicUsize::new(0);
        let items: Vec<(String, String)> = candidates.into_iter().collect();
        let workers = MAX_LIST_WORKERS.min(items.len());
        let spaces = parallel_map(items, workers, |(space_id, node_id)| {
            let n = match Node::read(&self.lu, &space_id, &node_id, true) {
                Ok(n) => n,
                Err(e) => {
                    error!(space_id = %space_id, node_id = %node_id, error = %e, "could not read node, skipping");
                    return Ok(None);
                }
            };
            if !n.exists {
                return Ok(None);
            }
            let space = match self.storage_space_from_node(ctx, &n, check_permissions) {
                Ok(s) => s,
                Err(FsError::NotFound(_)) | Err(FsError::PermissionDenied(_)) => return Ok(None),
                Err(e) => {
                    error!(space_id = %space_id, error = %e, "could not convert to storage space");
                    return Ok(None);
                }
            };
            if space.space_type == Some(SpaceType::Share) {
                shares.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Ok(type_matches(&space).then_some(space))
        })?;

        let spaces: Vec<StorageSpace> = spaces.into_iter().flatten().collect();
        debug!(count = spaces.len(), shares = shares.load(Ordering::Relaxed), "listed spaces");
        Ok(spaces)
    }

    /// Changes the properties of a space, or re-enables it with `restore`.
    pub fn update_storage_space(
        &self,
        ctx: &OpContext,
        space_id: &str,
        update: SpaceUpdate,
        restore: bool,
    ) -> FsResult<StorageSpace> {
        let _enter = ctx.span().enter();
        let mut a = Attributes::new();
        if let Some(name) = update.name.as_deref().filter(|n| !n.is_empty()) {
            a.set_string(attrs::NAME, name);
            a.set_string(attrs::SPACE_NAME, name);
        }
        if update.quota.is_some() {
            if let Some(q) = self.capped_quota(update.quota)? {
                a.set_string(attrs::QUOTA, &q.to_string());
            }
        }
        if let Some(d) = &update.description {
            a.set_string(attrs::SPACE_DESCRIPTION, d);
        }
        if let Some(alias) = update.alias.as_deref().filter(|v| !v.is_empty()) {
            a.set_string(attrs::SPACE_ALIAS, alias);
        }
        if let Some(image) = update.image.as_deref().filter(|v| !v.is_empty()) {
            a.set_string(attrs::SPACE_IMAGE, image);
        }
        if let Some(readme) = update.readme.as_deref().filter(|v| !v.is_empty()) {
            a.set_string(attrs::SPACE_README, readme);
        }

        let root = Node::read(&self.lu, space_id, space_id, true)?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }

        let sp = self.permissions.assemble_permissions(&ctx.user, &root)?;
        if !restore && a.is_empty() && !sp.is_viewer() {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }

        let client = self.permissions.client();
        if !sp.is_manager() {
            let mut guarded = vec![attrs::NAME, attrs::SPACE_DESCRIPTION];
            if !sp.is_editor() {
                guarded.extend([attrs::SPACE_README, attrs::SPACE_ALIAS, attrs::SPACE_IMAGE]);
            }
            if guarded.iter().any(|k| a.contains(k)) && !client.manage_space_properties(&ctx.user, space_id) {
                return Err(FsError::PermissionDenied(format!("space {}", space_id)));
            }
            if restore && !client.space_ability(&ctx.user, space_id) {
                return Err(FsError::NotFound(format!("space {}", space_id)));
            }
        }

        if a.contains(attrs::QUOTA) {
            if root.xattr_string(attrs::SPACE_TYPE).is_err() {
                return Err(FsError::Internal("space has no type".to_string()));
            }
            if !client.set_space_quota(&ctx.user, space_id) {
                return Err(FsError::PermissionDenied(format!("space {}", space_id)));
            }
        }

        if let Some(new_image) = a.string(attrs::SPACE_IMAGE) {
            if let Ok(old) = root.xattr_string(attrs::SPACE_IMAGE) {
                if !old.is_empty() && old != new_image {
                    if let Err(e) = self.delete(ctx, &Reference::id(space_id, &old)) {
                        warn!(space_id, image = %old, error = %e, "could not delete previous space image");
                    }
                }
            }
        }

        a.set_string(attrs::TMTIME, &format_time(&Utc::now()));
        root.set_xattrs(a, true)?;
        if restore {
            root.set_dtime(None)?;
            info!(space_id, "restored space");
        }

        let root = Node::read(&self.lu, space_id, space_id, true)?;
        self.storage_space_from_node(ctx, &root, false)
    }

    /// Disables a space, or removes a disabled space for good with `purge`.
    pub fn delete_storage_space(&self, ctx: &OpContext, space_id: &str, purge: bool) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let n = Node::read(&self.lu, space_id, space_id, true)?;
        if !n.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }
        let space_type = n.xattr_string(attrs::SPACE_TYPE).map_err(|_| {
            FsError::Internal(format!("space {} does not have a space type", space_id))
        })?;
        self.can_delete_space(ctx, &n, &space_type, purge)?;

        if !purge {
            n.set_dtime(Some(&Utc::now()))?;
            info!(space_id, "disabled space");
            return Ok(());
        }

        if n.dtime().is_err() {
            return Err(FsError::BadRequest("can't purge enabled space".to_string()));
        }
        self.purge_space(&n, &space_type)?;
        info!(space_id, "purged space");
        Ok(())
    }

    fn can_delete_space(&self, ctx: &OpContext, n: &Node, space_type: &str, purge: bool) -> FsResult<()> {
        let client = self.permissions.client();
        if space_type == SpaceType::Personal.as_str() {
            if client.delete_all_home_spaces(&ctx.user) {
                return Ok(());
            }
            return Err(FsError::PermissionDenied(
                "user is not allowed to delete a personal space".to_string(),
            ));
        }
        if matches!(self.permissions.assemble_permissions(&ctx.user, n), Ok(rp) if rp.is_manager()) {
            return Ok(());
        }
        if purge && client.delete_all_spaces(&ctx.user) {
            return Ok(());
        }
        if !purge && client.space_ability(&ctx.user, &n.space_id) {
            return Ok(());
        }
        Err(FsError::PermissionDenied(format!(
            "user is not allowed to delete space {}",
            n.id
        )))
    }

    /// Removes every node, trash item, blob and index entry of a space.
    fn purge_space(&self, root: &Node, space_type: &str) -> FsResult<()> {
        let space_id = &root.space_id;
        self.indexes.by_type.remove(space_type, space_id)?;
        for g in root.list_grants()? {
            self.unlink_grantee(&g.grantee, space_id)?;
        }
        if let Some(owner) = &root.owner {
            self.indexes.by_user.remove(owner.as_str(), space_id)?;
        }

        for (key, _) in self.tree.trash_keys(space_id)? {
            let purged = self
                .tree
                .read_recycle_item(space_id, &key, "")
                .and_then(|t| self.tree.purge_recycle_item(&t));
            if let Err(e) = purged {
                warn!(space_id = %space_id, key = %key, error = %e, "could not purge trash item");
            }
        }
        self.tree.remove_node(&root.internal_path(), root)?;

        let space_path = self.lu.space_path(space_id);
        match fs::remove_dir_all(&space_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = space_path.parent() {
            // only succeeds once no other space shares the prefix
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    /// Builds the caller facing record of the space `n` belongs to.
    ///
    /// Expired grants found on the way are removed together with their
    /// index entries.
    pub fn storage_space_from_node(&self, ctx: &OpContext, n: &Node, check_permissions: bool) -> FsResult<StorageSpace> {
        let root = if n.is_space_root() { n.clone() } else { n.space_root()? };
        let disabled = root.dtime().is_ok();
        if check_permissions && disabled {
            let rp = self.permissions.assemble_permissions(&ctx.user, n);
            if !matches!(rp, Ok(rp) if rp.is_manager()) {
                return Err(FsError::PermissionDenied(format!(
                    "user {} is not allowed to list deleted space {}",
                    ctx.user.username, n.id
                )));
            }
        }

        let name = match root.xattr_string(attrs::SPACE_NAME) {
            Ok(s) => s,
            Err(e) => {
                debug!(space_id = %n.space_id, error = %e, "space does not have a name attribute");
                String::new()
            }
        };

        if check_permissions {
            let rp = self.permissions.assemble_permissions(&ctx.user, n)?;
            if !rp.contains(PermissionSet::STAT) {
                return Err(FsError::NotFound(format!("space {} not found", n.id)));
            }
        }

        let mut grants = BTreeMap::new();
        let mut grant_expirations = BTreeMap::new();
        let mut groups = BTreeSet::new();
        for g in n.list_grants()? {
            if g.is_expired() {
                self.evict_expired_grant(n, &g);
                continue;
            }
            let principal = g.grantee.principal();
            if let Grantee::Group(gid) = &g.grantee {
                groups.insert(gid.clone());
            }
            if let Some(exp) = g.expiration {
                grant_expirations.insert(principal.clone(), exp);
            }
            grants.insert(principal, g.permissions);
        }

        let tmtime = n.tmtime().ok();
        let etag = calculate_etag(&n.id, &tmtime.unwrap_or_default());
        let a = root.xattrs()?;
        let raw_quota = a.string(attrs::QUOTA);
        let usage = quota::usage(raw_quota.as_deref(), root.size()?)?;
        let space_ref = |attr: &str| {
            a.string(attr)
                .filter(|v| !v.is_empty())
                .map(|v| ResourceId::new(&root.space_id, v))
        };

        let root_perms = self
            .permissions
            .assemble_permissions(&ctx.user, &root)
            .unwrap_or(PermissionSet::NONE);
        let root_info = root.as_resource_info(root_perms, "/".to_string()).ok();

        Ok(StorageSpace {
            id: root.resource_id().to_string(),
            root: root.resource_id(),
            name,
            space_type: a.string(attrs::SPACE_TYPE).and_then(|t| t.parse().ok()),
            owner: n.owner.clone(),
            grants,
            grant_expirations,
            groups,
            mtime: tmtime,
            etag,
            quota: a.int64(attrs::QUOTA).filter(|q| *q >= 0).map(|q| q as u64),
            usage,
            image: space_ref(attrs::SPACE_IMAGE),
            readme: space_ref(attrs::SPACE_README),
            alias: a.string(attrs::SPACE_ALIAS).filter(|v| !v.is_empty()),
            description: a.string(attrs::SPACE_DESCRIPTION).filter(|v| !v.is_empty()),
            trashed: disabled,
            root_info,
        })
    }
}
