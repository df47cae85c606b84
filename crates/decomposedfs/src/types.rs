//! Core identifier and reference types shared by all engine modules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Opaque identifier of a user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a new user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    /// Creates a new group id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An authenticated actor as seen by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user id.
    pub id: UserId,
    /// Login name, used by alias and home templates.
    pub username: String,
    /// Human readable name.
    pub display_name: String,
    /// Ids of the groups the user belongs to.
    pub groups: Vec<GroupId>,
}

impl User {
    /// Creates a user without groups whose username equals its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            username: id.clone(),
            display_name: id.clone(),
            id: UserId::new(id),
            groups: Vec::new(),
        }
    }

    /// Adds group memberships.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(GroupId::new));
        self
    }

    /// Returns true if the user is a member of `group`.
    pub fn in_group(&self, group: &GroupId) -> bool {
        self.groups.contains(group)
    }
}

/// The principal a grant applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grantee {
    /// A single user.
    User(UserId),
    /// Every member of a group.
    Group(GroupId),
}

impl Grantee {
    /// Principal string used in attribute names: `u:<id>` or `g:<id>`.
    pub fn principal(&self) -> String {
        match self {
            Grantee::User(u) => format!("u:{}", u),
            Grantee::Group(g) => format!("g:{}", g),
        }
    }

    /// Parses a principal string produced by [`Grantee::principal`].
    pub fn from_principal(principal: &str) -> FsResult<Self> {
        match principal.split_once(':') {
            Some(("u", id)) if !id.is_empty() => Ok(Grantee::User(UserId::new(id))),
            Some(("g", id)) if !id.is_empty() => Ok(Grantee::Group(GroupId::new(id))),
            _ => Err(FsError::Internal(format!("malformed principal {}", principal))),
        }
    }

    /// Returns true if this grantee names `user` directly or one of its groups.
    pub fn matches(&self, user: &User) -> bool {
        match self {
            Grantee::User(u) => *u == user.id,
            Grantee::Group(g) => user.in_group(g),
        }
    }
}

/// The kind of a storage space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    /// A user's home space.
    Personal,
    /// A shared project space managed through grants.
    Project,
    /// A space representing an incoming share.
    Share,
}

impl SpaceType {
    /// All known space types.
    pub const ALL: [SpaceType; 3] = [SpaceType::Personal, SpaceType::Project, SpaceType::Share];

    /// Returns the on-disk name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Personal => "personal",
            SpaceType::Project => "project",
            SpaceType::Share => "share",
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceType {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(SpaceType::Personal),
            "project" => Ok(SpaceType::Project),
            "share" => Ok(SpaceType::Share),
            other => Err(FsError::BadRequest(format!("unknown space type {}", other))),
        }
    }
}

/// Identifies a node inside a space. An empty `node_id` addresses the space root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Space the node lives in.
    pub space_id: String,
    /// Node id inside the space.
    pub node_id: String,
}

impl ResourceId {
    /// Creates a resource id.
    pub fn new(space_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.space_id, self.node_id)
    }
}

/// A reference as sent by the gateway: a resource id plus an optional
/// path relative to it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Anchor of the reference. Required by every operation.
    pub resource_id: Option<ResourceId>,
    /// Path relative to the anchor, `"."` or empty for the anchor itself.
    pub path: String,
}

impl Reference {
    /// References a node by id.
    pub fn id(space_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(ResourceId::new(space_id, node_id)),
            path: String::new(),
        }
    }

    /// References the root of a space.
    pub fn space_root(space_id: impl Into<String>) -> Self {
        let space_id = space_id.into();
        Self::id(space_id.clone(), space_id)
    }

    /// References a path relative to the root of a space.
    pub fn space_path(space_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::space_root(space_id).with_path(path)
    }

    /// Replaces the relative path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Returns the space id or `BadRequest` when the reference has none.
    pub fn space_id(&self) -> FsResult<&str> {
        match &self.resource_id {
            Some(id) if !id.space_id.is_empty() => Ok(&id.space_id),
            _ => Err(FsError::BadRequest("reference needs a space id".to_string())),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource_id {
            Some(id) if self.path.is_empty() => write!(f, "{}", id),
            Some(id) => write!(f, "{}:{}", id, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Per-operation context: who is acting, which lock they present, and the
/// span their log lines belong to.
#[derive(Clone, Debug)]
pub struct OpContext {
    /// The acting user.
    pub user: User,
    /// Lock id presented by the caller, if any.
    pub lock_id: Option<String>,
    /// Id of the client that initiated the request.
    pub initiator_id: Option<String>,
    span: tracing::Span,
}

impl OpContext {
    /// Creates a context for `user`.
    pub fn new(user: User) -> Self {
        let span = tracing::info_span!("dfs", user = %user.id);
        Self {
            user,
            lock_id: None,
            initiator_id: None,
            span,
        }
    }

    /// Attaches a lock id to the context.
    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    /// Attaches the initiating client id.
    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator_id = Some(initiator.into());
        self
    }

    /// The span operations run in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// Formats a timestamp the way it is stored in node attributes.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses a timestamp stored by [`format_time`].
pub fn parse_time(s: &str) -> FsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FsError::Internal(format!("malformed time {}: {}", s, e)))
}
