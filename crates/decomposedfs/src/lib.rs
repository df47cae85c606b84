#![warn(missing_docs)]

//! Decomposed filesystem: a storage engine keeping a node tree as directories
//! and attribute sidecars on local disk, with storage spaces, grants, space
//! indexes, an upload postprocessing pipeline and a trashbin.
//!
//! Write path: initiate upload → write chunks → finish (node marked processing,
//! size propagated) → postprocessing events → finalize blob or revert.

pub mod attrs;
pub mod blobstore;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod grants;
pub mod index;
pub mod locks;
pub mod lookup;
pub mod metadata;
pub mod node;
pub mod parallel;
pub mod permissions;
pub mod postprocessing;
pub mod processing;
pub mod quota;
pub mod sidecar;
pub mod spaces;
pub mod telemetry;
pub mod trashbin;
pub mod tree;
pub mod types;
pub mod upload;

pub use blobstore::{Blobstore, FsBlobstore};
pub use config::{LogConfig, MetadataBackendKind, Options};
pub use error::{FsError, FsResult};
pub use events::{Event, EventBus, EventPublisher, Outcome, RecordingPublisher, ScanResult};
pub use fs::Decomposedfs;
pub use grants::Grant;
pub use index::{FileIndex, SpaceIndex, SpaceIndexes};
pub use locks::Lock;
pub use lookup::Lookup;
pub use metadata::{Attributes, MemoryBackend, MetadataBackend, MetadataLock};
pub use node::{Node, NodeKind, ResourceInfo};
pub use permissions::{AdminPolicy, PermissionSet, Permissions, PermissionsClient, StaticUserDirectory, UserDirectory};
pub use postprocessing::{spawn_consumers, Consumers};
pub use processing::ProcessingState;
pub use quota::QuotaUsage;
pub use sidecar::SidecarBackend;
pub use spaces::{CreateSpaceRequest, SpaceFilter, SpaceUpdate, StorageSpace};
pub use trashbin::{DecomposedTrashbin, RecycleItem, Trashbin};
pub use tree::Tree;
pub use types::{GroupId, Grantee, OpContext, Reference, ResourceId, SpaceType, User, UserId};
pub use upload::{Preconditions, SessionStore, UploadOptions, UploadSession};
