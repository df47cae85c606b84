//! Names of the node attributes persisted by the metadata backend.

/// Common prefix of every engine attribute.
pub const PREFIX: &str = "user.ocis.";

/// Node id.
pub const ID: &str = "user.ocis.id";
/// Id of the parent node.
pub const PARENT_ID: &str = "user.ocis.parentid";
/// Name of the node inside its parent.
pub const NAME: &str = "user.ocis.name";
/// Node kind, see `NodeKind::as_i64`.
pub const TYPE: &str = "user.ocis.type";
/// Id of the blob holding the file content.
pub const BLOB_ID: &str = "user.ocis.blobid";
/// Size of the blob in bytes.
pub const BLOB_SIZE: &str = "user.ocis.blobsize";
/// Owner user id.
pub const OWNER_ID: &str = "user.ocis.owner.id";
/// Space id stored on space roots.
pub const SPACE_ID: &str = "user.ocis.space.id";
/// Aggregate size of all files below a directory.
pub const TREE_SIZE: &str = "user.ocis.treesize";
/// Marks directories that take part in propagation.
pub const PROPAGATION: &str = "user.ocis.propagation";
/// Tree modification time, refreshed by propagation.
pub const TMTIME: &str = "user.ocis.tmtime";
/// Modification time of the node itself.
pub const MTIME: &str = "user.ocis.mtime";
/// Disable time of a space root.
pub const DTIME: &str = "user.ocis.dtime";
/// Quota of a space root in bytes, or one of the quota sentinels.
pub const QUOTA: &str = "user.ocis.quota";
/// Display name of a space.
pub const SPACE_NAME: &str = "user.ocis.space.name";
/// Type of a space.
pub const SPACE_TYPE: &str = "user.ocis.space.type";
/// Alias of a space.
pub const SPACE_ALIAS: &str = "user.ocis.space.alias";
/// Description of a space.
pub const SPACE_DESCRIPTION: &str = "user.ocis.space.description";
/// Node id of the space image.
pub const SPACE_IMAGE: &str = "user.ocis.space.image";
/// Node id of the space readme.
pub const SPACE_README: &str = "user.ocis.space.readme";
/// Processing status, `processing:<session id>` while an upload owns the node.
pub const STATUS: &str = "user.ocis.nodestatus";
/// Result of the last virus scan.
pub const SCAN_STATUS: &str = "user.ocis.scanstatus";
/// Time of the last virus scan.
pub const SCAN_DATE: &str = "user.ocis.scandate";
/// Path the node had before it was trashed.
pub const TRASH_ORIGIN: &str = "user.ocis.trash.origin";
/// Prefix of checksum attributes.
pub const CHECKSUM_PREFIX: &str = "user.ocis.cs.";
/// Blake3 checksum of the content.
pub const CHECKSUM_BLAKE3: &str = "user.ocis.cs.blake3";
/// Prefix of grant attributes, followed by the grantee principal.
pub const GRANT_PREFIX: &str = "user.ocis.grant.";
/// Prefix of user grant attributes.
pub const GRANT_USER_PREFIX: &str = "user.ocis.grant.u:";
/// Prefix of group grant attributes.
pub const GRANT_GROUP_PREFIX: &str = "user.ocis.grant.g:";

/// Value stored in [`STATUS`] before the session id.
pub const PROCESSING_STATUS: &str = "processing:";

/// Quota value meaning "no limit".
pub const QUOTA_UNLIMITED: &str = "0";
/// Quota value meaning "not calculated yet".
pub const QUOTA_UNCALCULATED: &str = "-1";
/// Quota value meaning "unknown".
pub const QUOTA_UNKNOWN: &str = "-2";

/// Attributes that describe the current content of a file. These are the
/// ones saved into a version record and restored when an upload is reverted.
pub fn is_content_attr(name: &str) -> bool {
    name.starts_with(CHECKSUM_PREFIX)
        || name == TYPE
        || name == BLOB_ID
        || name == BLOB_SIZE
        || name == MTIME
}
