//! Access grants on nodes.
//!
//! A grant is stored as one attribute per grantee, `user.ocis.grant.u:<id>`
//! or `user.ocis.grant.g:<id>`, holding the JSON encoded [`Grant`]. Grants
//! on a space root are space memberships and are mirrored into the by-user
//! and by-group indexes; grants anywhere else are shares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::attrs;
use crate::error::{FsError, FsResult};
use crate::events::Event;
use crate::fs::Decomposedfs;
use crate::metadata::{Attributes, MetadataLock};
use crate::node::Node;
use crate::permissions::{authorize, PermissionSet};
use crate::types::{Grantee, OpContext, Reference, SpaceType, UserId};

/// Permissions granted to a user or group on a node and its subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Who the grant applies to.
    pub grantee: Grantee,
    /// What the grantee may do. Empty for deny grants.
    pub permissions: PermissionSet,
    /// User that created the grant.
    #[serde(default)]
    pub creator: Option<UserId>,
    /// When the grant stops applying.
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Grant {
    /// Creates a grant without creator or expiration.
    pub fn new(grantee: Grantee, permissions: PermissionSet) -> Self {
        Self {
            grantee,
            permissions,
            creator: None,
            expiration: None,
        }
    }

    /// A grant that denies all access to `grantee`.
    pub fn deny(grantee: Grantee, creator: Option<UserId>) -> Self {
        Self {
            grantee,
            permissions: PermissionSet::NONE,
            creator,
            expiration: None,
        }
    }

    /// Sets the creator.
    pub fn with_creator(mut self, creator: UserId) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Sets the expiration time.
    pub fn with_expiration(mut self, t: DateTime<Utc>) -> Self {
        self.expiration = Some(t);
        self
    }

    /// Returns true for grants carrying no permissions.
    pub fn is_deny(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Returns true once the expiration time has passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.expiration, Some(t) if t < Utc::now())
    }

    /// Attribute name the grant is stored under.
    pub fn attr_key(&self) -> String {
        format!("{}{}", attrs::GRANT_PREFIX, self.grantee.principal())
    }
}

impl Node {
    /// Writes `grant`, replacing any previous grant of the same grantee.
    pub fn store_grant_attr(&self, grant: &Grant, acquire_lock: bool) -> FsResult<()> {
        let mut a = Attributes::new();
        a.set(grant.attr_key(), serde_json::to_vec(grant)?);
        self.set_xattrs(a, acquire_lock)
    }
}

impl Decomposedfs {
    /// Denies `grantee` all access to the referenced node.
    pub fn deny_grant(&self, ctx: &OpContext, reference: &Reference, grantee: &Grantee) -> FsResult<()> {
        let _enter = ctx.span().enter();
        debug!(reference = %reference, grantee = %grantee.principal(), "deny grant");
        let (node, _lock, _) = self.load_grant(reference, grantee)?;

        let rp = self.permissions.assemble_permissions(&ctx.user, &node)?;
        authorize(rp, PermissionSet::DENY_GRANT, &reference.to_string())?;
        node.check_lock(ctx)?;

        let grant = Grant::deny(grantee.clone(), Some(ctx.user.id.clone()));
        self.store_grant(&node, &grant)
    }

    /// Adds a grant. Fails with `AlreadyExists` if the grantee already has
    /// one on the node.
    pub fn add_grant(&self, ctx: &OpContext, reference: &Reference, grant: &Grant) -> FsResult<()> {
        let _enter = ctx.span().enter();
        debug!(reference = %reference, grantee = %grant.grantee.principal(), "add grant");
        let (node, _lock, existing) = self.load_grant(reference, &grant.grantee)?;
        if existing.is_some() {
            return Err(FsError::AlreadyExists(format!("{}/{}", node.parent_id, node.name)));
        }

        // a freshly created project space has neither an owner nor grants,
        // its first grant names the manager
        let bootstrap = node.is_space_root()
            && node.list_grants()?.is_empty()
            && match &node.owner {
                None => true,
                Some(o) => o.as_str().is_empty() || o.as_str() == node.space_id,
            };
        if !bootstrap {
            let rp = self.permissions.assemble_permissions(&ctx.user, &node)?;
            authorize(rp, PermissionSet::ADD_GRANT, &reference.to_string())?;
            node.check_lock(ctx)?;
        }

        let mut grant = grant.clone();
        if grant.creator.is_none() {
            grant.creator = Some(ctx.user.id.clone());
        }
        self.store_grant(&node, &grant)
    }

    /// Lists grants on the referenced node.
    ///
    /// Callers without `ListGrants` only see grants they created or that
    /// name them. Expired grants are evicted instead of listed.
    pub fn list_grants(&self, ctx: &OpContext, reference: &Reference) -> FsResult<Vec<Grant>> {
        let _enter = ctx.span().enter();
        let node = self.lu.node_from_resource(reference)?;
        if !node.exists {
            return Err(FsError::NotFound(format!("{}/{}", node.parent_id, node.name)));
        }
        let rp = self.permissions.assemble_permissions(&ctx.user, &node)?;
        let can_list = rp.contains(PermissionSet::LIST_GRANTS);
        if !can_list && !rp.contains(PermissionSet::STAT) {
            return Err(FsError::NotFound(reference.to_string()));
        }
        let uid = &ctx.user.id;
        let mut grants = Vec::new();
        for g in node.list_grants()? {
            if g.is_expired() {
                self.evict_expired_grant(&node, &g);
                continue;
            }
            if can_list || g.creator.as_ref() == Some(uid) || matches!(&g.grantee, Grantee::User(u) if u == uid) {
                grants.push(g);
            }
        }
        Ok(grants)
    }

    /// Replaces an existing grant. The grant's creator may always do so.
    pub fn update_grant(&self, ctx: &OpContext, reference: &Reference, grant: &Grant) -> FsResult<()> {
        let _enter = ctx.span().enter();
        debug!(reference = %reference, grantee = %grant.grantee.principal(), "update grant");
        let (node, _lock, existing) = self.load_grant(reference, &grant.grantee)?;
        let Some(existing) = existing else {
            return Err(FsError::NotFound(grant.grantee.principal()));
        };
        if existing.creator.as_ref() != Some(&ctx.user.id) {
            let rp = self.permissions.assemble_permissions(&ctx.user, &node)?;
            authorize(rp, PermissionSet::UPDATE_GRANT, &reference.to_string())?;
        }
        node.check_lock(ctx)?;

        let mut grant = grant.clone();
        if grant.creator.is_none() {
            grant.creator = existing.creator;
        }
        self.store_grant(&node, &grant)
    }

    /// Removes a grant. The grant's creator may always do so.
    pub fn remove_grant(&self, ctx: &OpContext, reference: &Reference, grant: &Grant) -> FsResult<()> {
        let _enter = ctx.span().enter();
        debug!(reference = %reference, grantee = %grant.grantee.principal(), "remove grant");
        let (node, _lock, existing) = self.load_grant(reference, &grant.grantee)?;
        let Some(existing) = existing else {
            return Err(FsError::NotFound("grant not found".to_string()));
        };
        if existing.creator.as_ref() != Some(&ctx.user.id) {
            let rp = self.permissions.assemble_permissions(&ctx.user, &node)?;
            authorize(rp, PermissionSet::REMOVE_GRANT, &reference.to_string())?;
        }
        node.check_lock(ctx)?;

        node.delete_grant(&grant.grantee, false)?;
        if node.is_space_root() {
            self.unlink_grantee(&grant.grantee, &node.space_id)?;
        }
        self.tree.propagate(&node, 0)
    }

    /// Resolves the node and takes its metadata lock before looking up the
    /// grant of `grantee`, so the caller decides and persists under the lock.
    fn load_grant(&self, reference: &Reference, grantee: &Grantee) -> FsResult<(Node, MetadataLock, Option<Grant>)> {
        let node = self.lu.node_from_resource(reference)?;
        if !node.exists {
            return Err(FsError::NotFound(format!("{}/{}", node.parent_id, node.name)));
        }
        let lock = self.lu.metadata_backend().lock(&node.internal_path());
        let existing = node
            .list_grants()?
            .into_iter()
            .find(|g| g.grantee == *grantee);
        Ok((node, lock, existing))
    }

    /// Persists a grant while the caller holds the node's metadata lock and
    /// updates the indexes.
    pub(crate) fn store_grant(&self, node: &Node, grant: &Grant) -> FsResult<()> {
        if let Err(e) = node.store_grant_attr(grant, false) {
            error!(node_id = %node.id, principal = %grant.grantee.principal(), error = %e, "could not set grant for principal");
            return Err(e);
        }

        if node.is_space_root() {
            let space_type = node
                .xattr_string(attrs::SPACE_TYPE)
                .unwrap_or_else(|_| SpaceType::Share.to_string());
            self.indexes.by_type.add(&space_type, &node.space_id, &node.id)?;
            self.link_grantee(&grant.grantee, &node.space_id, &node.id)?;
        } else {
            // shares are only counted by type, never per grantee
            self.indexes
                .by_type
                .add(SpaceType::Share.as_str(), &node.space_id, &node.id)?;
        }
        self.tree.propagate(node, 0)
    }

    /// Deletes an expired grant. On a space root the grantee's index entry
    /// goes too and the lost membership is published. Failures are logged.
    pub(crate) fn evict_expired_grant(&self, n: &Node, g: &Grant) {
        let principal = g.grantee.principal();
        let deleted = n.delete_grant(&g.grantee, true);
        if let Err(e) = &deleted {
            error!(space_id = %n.space_id, grantee = %principal, error = %e, "failed to delete expired grant");
        }
        if !n.is_space_root() {
            return;
        }
        if let Err(e) = self.unlink_grantee(&g.grantee, &n.space_id) {
            error!(space_id = %n.space_id, grantee = %principal, error = %e, "failed to delete expired space index entry");
        }
        if deleted.is_ok() {
            let event = Event::SpaceMembershipExpired {
                space_id: n.space_id.clone(),
                space_name: n.xattr_string(attrs::SPACE_NAME).unwrap_or_default(),
                grantee: principal.clone(),
                expired_at: g.expiration,
            };
            if let Err(e) = self.events.publish(event) {
                error!(space_id = %n.space_id, error = %e, "error publishing SpaceMembershipExpired event");
            }
        }
        debug!(space_id = %n.space_id, grantee = %principal, "evicted expired grant");
    }

    pub(crate) fn link_grantee(&self, grantee: &Grantee, space_id: &str, node_id: &str) -> FsResult<()> {
        match grantee {
            Grantee::User(u) => self.indexes.by_user.add(u.as_str(), space_id, node_id),
            Grantee::Group(g) => self.indexes.by_group.add(g.as_str(), space_id, node_id),
        }
    }

    pub(crate) fn unlink_grantee(&self, grantee: &Grantee, space_id: &str) -> FsResult<()> {
        match grantee {
            Grantee::User(u) => self.indexes.by_user.remove(u.as_str(), space_id),
            Grantee::Group(g) => self.indexes.by_group.remove(g.as_str(), space_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupId;

    #[test]
    fn test_deny_grant_is_empty() {
        let g = Grant::deny(Grantee::User(UserId::new("bob")), None);
        assert!(g.is_deny());
        assert!(!Grant::new(Grantee::User(UserId::new("bob")), PermissionSet::viewer()).is_deny());
    }

    #[test]
    fn test_expiration() {
        let g = Grant::new(Grantee::Group(GroupId::new("staff")), PermissionSet::viewer());
        assert!(!g.is_expired());
        let past = g.clone().with_expiration(Utc::now() - chrono::Duration::hours(1));
        assert!(past.is_expired());
        let future = g.with_expiration(Utc::now() + chrono::Duration::hours(1));
        assert!(!future.is_expired());
    }

    #[test]
    fn test_attr_key() {
        let g = Grant::new(Grantee::Group(GroupId::new("staff")), PermissionSet::viewer());
        assert_eq!(g.attr_key(), "user.ocis.grant.g:staff");
    }

    #[test]
    fn test_json_round_trip_keeps_creator() {
        let g = Grant::new(Grantee::User(UserId::new("bob")), PermissionSet::editor())
            .with_creator(UserId::new("alice"));
        let back: Grant = serde_json::from_slice(&serde_json::to_vec(&g).unwrap()).unwrap();
        assert_eq!(back, g);
    }
}
