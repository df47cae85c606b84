//! Permission sets, role presets and the assembly of effective permissions.
//!
//! Node level permissions come from grants stored on the node and its
//! ancestors. Space level decisions (creating spaces, setting quotas, listing
//! other users' spaces) are delegated to a [`PermissionsClient`] backed by the
//! external policy service.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::node::Node;
use crate::types::{User, UserId};

/// Bitmask of resource permissions.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(pub u32);

impl PermissionSet {
    /// No permission at all. As a grant this denies access.
    pub const NONE: PermissionSet = PermissionSet(0);
    /// Add grants to a resource.
    pub const ADD_GRANT: PermissionSet = PermissionSet(1 << 0);
    /// Create a directory.
    pub const CREATE_CONTAINER: PermissionSet = PermissionSet(1 << 1);
    /// Delete a resource.
    pub const DELETE: PermissionSet = PermissionSet(1 << 2);
    /// Resolve the path of a resource.
    pub const GET_PATH: PermissionSet = PermissionSet(1 << 3);
    /// Read the quota of a space.
    pub const GET_QUOTA: PermissionSet = PermissionSet(1 << 4);
    /// Download file content.
    pub const INITIATE_FILE_DOWNLOAD: PermissionSet = PermissionSet(1 << 5);
    /// Upload file content.
    pub const INITIATE_FILE_UPLOAD: PermissionSet = PermissionSet(1 << 6);
    /// List all grants of a resource.
    pub const LIST_GRANTS: PermissionSet = PermissionSet(1 << 7);
    /// List the children of a directory.
    pub const LIST_CONTAINER: PermissionSet = PermissionSet(1 << 8);
    /// List the versions of a file.
    pub const LIST_FILE_VERSIONS: PermissionSet = PermissionSet(1 << 9);
    /// List the trash of a space.
    pub const LIST_RECYCLE: PermissionSet = PermissionSet(1 << 10);
    /// Move or rename a resource.
    pub const MOVE: PermissionSet = PermissionSet(1 << 11);
    /// Remove grants from a resource.
    pub const REMOVE_GRANT: PermissionSet = PermissionSet(1 << 12);
    /// Purge items from the trash.
    pub const PURGE_RECYCLE: PermissionSet = PermissionSet(1 << 13);
    /// Restore a previous file version.
    pub const RESTORE_FILE_VERSION: PermissionSet = PermissionSet(1 << 14);
    /// Restore items from the trash.
    pub const RESTORE_RECYCLE_ITEM: PermissionSet = PermissionSet(1 << 15);
    /// Read the metadata of a resource.
    pub const STAT: PermissionSet = PermissionSet(1 << 16);
    /// Change existing grants.
    pub const UPDATE_GRANT: PermissionSet = PermissionSet(1 << 17);
    /// Place deny grants below a resource.
    pub const DENY_GRANT: PermissionSet = PermissionSet(1 << 18);

    const NAMES: [(&'static str, PermissionSet); 19] = [
        ("add_grant", Self::ADD_GRANT),
        ("create_container", Self::CREATE_CONTAINER),
        ("delete", Self::DELETE),
        ("get_path", Self::GET_PATH),
        ("get_quota", Self::GET_QUOTA),
        ("initiate_file_download", Self::INITIATE_FILE_DOWNLOAD),
        ("initiate_file_upload", Self::INITIATE_FILE_UPLOAD),
        ("list_grants", Self::LIST_GRANTS),
        ("list_container", Self::LIST_CONTAINER),
        ("list_file_versions", Self::LIST_FILE_VERSIONS),
        ("list_recycle", Self::LIST_RECYCLE),
        ("move", Self::MOVE),
        ("remove_grant", Self::REMOVE_GRANT),
        ("purge_recycle", Self::PURGE_RECYCLE),
        ("restore_file_version", Self::RESTORE_FILE_VERSION),
        ("restore_recycle_item", Self::RESTORE_RECYCLE_ITEM),
        ("stat", Self::STAT),
        ("update_grant", Self::UPDATE_GRANT),
        ("deny_grant", Self::DENY_GRANT),
    ];

    /// Every permission.
    pub const ALL: PermissionSet = PermissionSet((1 << 19) - 1);

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: PermissionSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Union of both sets.
    pub fn union(self, other: PermissionSet) -> PermissionSet {
        PermissionSet(self.0 | other.0)
    }

    /// Managers may remove grants.
    pub fn is_manager(&self) -> bool {
        self.contains(Self::REMOVE_GRANT)
    }

    /// Editors may upload.
    pub fn is_editor(&self) -> bool {
        self.contains(Self::INITIATE_FILE_UPLOAD)
    }

    /// Viewers may stat.
    pub fn is_viewer(&self) -> bool {
        self.contains(Self::STAT)
    }

    /// Read-only access to a shared resource.
    pub fn viewer() -> Self {
        Self::GET_PATH
            | Self::GET_QUOTA
            | Self::INITIATE_FILE_DOWNLOAD
            | Self::LIST_CONTAINER
            | Self::LIST_RECYCLE
            | Self::STAT
    }

    /// Read-only member of a project space.
    pub fn space_viewer() -> Self {
        Self::viewer() | Self::LIST_GRANTS
    }

    /// Read-write access to a shared resource.
    pub fn editor() -> Self {
        Self::viewer()
            | Self::CREATE_CONTAINER
            | Self::DELETE
            | Self::INITIATE_FILE_UPLOAD
            | Self::MOVE
            | Self::RESTORE_RECYCLE_ITEM
    }

    /// Read-write member of a project space.
    pub fn space_editor() -> Self {
        Self::editor() | Self::LIST_FILE_VERSIONS | Self::LIST_GRANTS | Self::RESTORE_FILE_VERSION
    }

    /// Manager of a project space.
    pub fn manager() -> Self {
        Self::space_editor()
            | Self::PURGE_RECYCLE
            | Self::ADD_GRANT
            | Self::REMOVE_GRANT
            | Self::UPDATE_GRANT
            | Self::DENY_GRANT
    }

    /// Owner of a resource.
    pub fn owner() -> Self {
        Self::ALL
    }
}

impl BitOr for PermissionSet {
    type Output = PermissionSet;

    fn bitor(self, rhs: PermissionSet) -> PermissionSet {
        self.union(rhs)
    }
}

impl BitOrAssign for PermissionSet {
    fn bitor_assign(&mut self, rhs: PermissionSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, p)| self.contains(*p))
            .map(|(n, _)| *n)
            .collect();
        write!(f, "PermissionSet({})", names.join("|"))
    }
}

/// Space level permission queries answered by the policy service.
pub trait PermissionsClient: Send + Sync {
    /// May list every space of the instance.
    fn list_all_spaces(&self, user: &User) -> bool;
    /// May list the spaces of `target`.
    fn list_spaces_of_user(&self, user: &User, target: &UserId) -> bool;
    /// May purge any space.
    fn delete_all_spaces(&self, user: &User) -> bool;
    /// May delete personal spaces.
    fn delete_all_home_spaces(&self, user: &User) -> bool;
    /// May create project spaces.
    fn create_space(&self, user: &User) -> bool;
    /// May disable and restore the given space.
    fn space_ability(&self, user: &User, space_id: &str) -> bool;
    /// May change the quota of the given space.
    fn set_space_quota(&self, user: &User, space_id: &str) -> bool;
    /// May change name and description of the given space.
    fn manage_space_properties(&self, user: &User, space_id: &str) -> bool;
}

/// A [`PermissionsClient`] granting every space level permission to a fixed
/// set of administrators and only project creation to everybody else.
#[derive(Clone, Debug, Default)]
pub struct AdminPolicy {
    admins: HashSet<UserId>,
}

impl AdminPolicy {
    /// Creates a policy with the given administrators.
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(|a| UserId::new(a)).collect(),
        }
    }

    fn is_admin(&self, user: &User) -> bool {
        self.admins.contains(&user.id)
    }
}

impl PermissionsClient for AdminPolicy {
    fn list_all_spaces(&self, user: &User) -> bool {
        self.is_admin(user)
    }

    fn list_spaces_of_user(&self, user: &User, target: &UserId) -> bool {
        user.id == *target || self.is_admin(user)
    }

    fn delete_all_spaces(&self, user: &User) -> bool {
        self.is_admin(user)
    }

    fn delete_all_home_spaces(&self, user: &User) -> bool {
        self.is_admin(user)
    }

    fn create_space(&self, _user: &User) -> bool {
        true
    }

    fn space_ability(&self, user: &User, _space_id: &str) -> bool {
        self.is_admin(user)
    }

    fn set_space_quota(&self, user: &User, _space_id: &str) -> bool {
        self.is_admin(user)
    }

    fn manage_space_properties(&self, user: &User, _space_id: &str) -> bool {
        self.is_admin(user)
    }
}

/// Resolves user ids to users with their group memberships.
pub trait UserDirectory: Send + Sync {
    /// Looks up a user. `NotFound` if unknown.
    fn resolve(&self, id: &UserId) -> FsResult<User>;
}

/// A [`UserDirectory`] over a fixed set of users.
#[derive(Clone, Debug, Default)]
pub struct StaticUserDirectory {
    users: HashMap<UserId, User>,
}

impl StaticUserDirectory {
    /// Creates a directory containing `users`.
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }

    /// Adds or replaces a user.
    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }
}

impl UserDirectory for StaticUserDirectory {
    fn resolve(&self, id: &UserId) -> FsResult<User> {
        self.users
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("user {}", id)))
    }
}

/// Assembles effective permissions and forwards space level queries.
#[derive(Clone)]
pub struct Permissions {
    client: Arc<dyn PermissionsClient>,
}

impl Permissions {
    /// Wraps a policy client.
    pub fn new(client: Arc<dyn PermissionsClient>) -> Self {
        Self { client }
    }

    /// The policy client.
    pub fn client(&self) -> &dyn PermissionsClient {
        self.client.as_ref()
    }

    /// Effective permissions of `user` on `node`.
    ///
    /// The space owner gets [`PermissionSet::owner`]. Everybody else gets the
    /// union of all unexpired grants naming them or one of their groups on
    /// the node and every ancestor up to the space root. A deny grant
    /// anywhere on that path yields [`PermissionSet::NONE`]. For an absent
    /// node the walk starts at its parent.
    pub fn assemble_permissions(&self, user: &User, node: &Node) -> FsResult<PermissionSet> {
        if node.owner.as_ref() == Some(&user.id) {
            return Ok(PermissionSet::owner());
        }
        let mut ap = PermissionSet::NONE;
        let mut current = node.clone();
        loop {
            if current.exists {
                let (np, denied) = current.read_user_permissions(user)?;
                if denied {
                    debug!(space_id = %node.space_id, node_id = %node.id, user = %user.id, "access denied by grant");
                    return Ok(PermissionSet::NONE);
                }
                ap |= np;
            }
            if current.is_space_root() || current.parent_id.is_empty() {
                break;
            }
            current = current.parent()?;
        }
        Ok(ap)
    }
}

/// Checks `required` against `perms`.
///
/// Callers that may not even stat the resource learn nothing about it and
/// get `NotFound`; everybody else gets `PermissionDenied`.
pub fn authorize(perms: PermissionSet, required: PermissionSet, resource: &str) -> FsResult<()> {
    if perms.contains(required) {
        return Ok(());
    }
    if perms.is_viewer() {
        Err(FsError::PermissionDenied(resource.to_string()))
    } else {
        Err(FsError::NotFound(resource.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_nested() {
        assert!(PermissionSet::space_editor().contains(PermissionSet::viewer()));
        assert!(PermissionSet::manager().contains(PermissionSet::space_editor()));
        assert!(PermissionSet::owner().contains(PermissionSet::manager()));
        assert!(PermissionSet::manager().is_manager());
        assert!(!PermissionSet::editor().is_manager());
        assert!(PermissionSet::editor().is_editor());
        assert!(!PermissionSet::viewer().is_editor());
        assert!(PermissionSet::viewer().is_viewer());
    }

    #[test]
    fn test_all_covers_every_named_bit() {
        let mut union = PermissionSet::NONE;
        for (_, p) in PermissionSet::NAMES {
            union |= p;
        }
        assert_eq!(union, PermissionSet::ALL);
    }

    #[test]
    fn test_debug_lists_names() {
        let p = PermissionSet::STAT | PermissionSet::MOVE;
        assert_eq!(format!("{:?}", p), "PermissionSet(move|stat)");
    }

    #[test]
    fn test_serde_is_a_plain_number() {
        let json = serde_json::to_string(&PermissionSet::STAT).unwrap();
        assert_eq!(json, (1u32 << 16).to_string());
    }

    #[test]
    fn test_authorize() {
        assert!(authorize(PermissionSet::editor(), PermissionSet::DELETE, "x").is_ok());
        match authorize(PermissionSet::viewer(), PermissionSet::DELETE, "x") {
            Err(FsError::PermissionDenied(_)) => {}
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
        match authorize(PermissionSet::NONE, PermissionSet::DELETE, "x") {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_admin_policy() {
        let policy = AdminPolicy::new(["admin"]);
        let admin = User::new("admin");
        let alice = User::new("alice");
        assert!(policy.list_all_spaces(&admin));
        assert!(!policy.list_all_spaces(&alice));
        assert!(policy.list_spaces_of_user(&alice, &UserId::new("alice")));
        assert!(!policy.list_spaces_of_user(&alice, &UserId::new("bob")));
        assert!(policy.create_space(&alice));
    }

    #[test]
    fn test_static_user_directory() {
        let dir = StaticUserDirectory::new([User::new("bob").with_groups(["staff"])]);
        let bob = dir.resolve(&UserId::new("bob")).unwrap();
        assert_eq!(bob.groups.len(), 1);
        assert!(dir.resolve(&UserId::new("carol")).unwrap_err().is_not_found());
    }
}
