//! Upload sessions.
//!
//! A session lives in the uploads directory as `<id>` (the received bytes)
//! and `<id>.info` (the JSON encoded [`UploadSession`]). Finishing an
//! upload creates or updates the target node right away and marks it as
//! processing; the blob is only written once postprocessing agrees.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::attrs;
use crate::error::{FsError, FsResult};
use crate::fs::Decomposedfs;
use crate::metadata::{Attributes, MetadataLock};
use crate::node::{calculate_etag, Node, NodeKind};
use crate::permissions::{authorize, PermissionSet};
use crate::processing::{Input, ProcessingState};
use crate::quota;
use crate::tree::REVISION_ID_DELIMITER;
use crate::types::{format_time, OpContext, Reference, ResourceId, User, UserId};

/// Conditional request headers checked against the node being replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    /// The current etag must match.
    pub if_match: Option<String>,
    /// None of these comma separated etags may match, `*` fails for any
    /// existing node.
    pub if_none_match: Option<String>,
    /// The node must not have been modified after this time.
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    fn check(&self, etag: &str, mtime: &DateTime<Utc>) -> FsResult<()> {
        if let Some(m) = &self.if_match {
            if m != etag {
                return Err(FsError::PreconditionFailed("etag mismatch".to_string()));
            }
        }
        if let Some(nm) = &self.if_none_match {
            if nm == "*" {
                return Err(FsError::PreconditionFailed("etag mismatch, resource exists".to_string()));
            }
            if nm.split(',').any(|t| t.trim() == etag) {
                return Err(FsError::PreconditionFailed("etag mismatch".to_string()));
            }
        }
        if let Some(t) = &self.if_unmodified_since {
            if mtime > t {
                return Err(FsError::PreconditionFailed("if-unmodified-since mismatch".to_string()));
            }
        }
        Ok(())
    }
}

/// Optional parameters of an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Modification time to set on the node.
    pub mtime: Option<DateTime<Utc>>,
    /// Conditions on the node being replaced.
    pub preconditions: Preconditions,
    /// When the session may be cleaned up if unfinished.
    pub expires: Option<DateTime<Utc>>,
}

/// Persistent state of one upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Session id. Also the id of the blob the upload becomes.
    pub id: String,
    /// Target space.
    pub space_id: String,
    /// Target node.
    pub node_id: String,
    /// Parent of the target node.
    pub parent_id: String,
    /// Name of the target node.
    pub filename: String,
    /// Announced size.
    pub size: u64,
    /// Bytes received so far.
    pub offset: u64,
    /// True if the target node existed when the node was prepared.
    pub node_exists: bool,
    /// Uploading user.
    pub executant: UserId,
    /// Lock id presented when the upload started.
    pub lock_id: Option<String>,
    /// Client that started the upload.
    pub initiator_id: Option<String>,
    /// Requested modification time.
    pub mtime: Option<DateTime<Utc>>,
    /// Conditions on the replaced node.
    #[serde(default)]
    pub preconditions: Preconditions,
    /// When the session was created.
    pub created: DateTime<Utc>,
    /// When an unfinished session may be removed.
    pub expires: Option<DateTime<Utc>>,
    /// Change of the node's size caused by this upload.
    #[serde(default)]
    pub size_diff: i64,
    /// Version record holding the replaced content attributes.
    pub versions_path: Option<PathBuf>,
    /// Blake3 checksum of the received bytes, hex encoded.
    pub checksum: Option<String>,
    /// Virus scan description and date.
    pub scan: Option<(String, DateTime<Utc>)>,
    /// Lifecycle state.
    pub state: ProcessingState,
}

impl UploadSession {
    /// Id of the target node.
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.space_id, &self.node_id)
    }

    /// True once the upload replaced existing content.
    pub fn is_version(&self) -> bool {
        self.node_exists && self.versions_path.is_some()
    }

    /// Context the session's node operations run in.
    pub fn context(&self) -> OpContext {
        let mut ctx = OpContext::new(User::new(self.executant.as_str()));
        ctx.lock_id = self.lock_id.clone();
        ctx.initiator_id = self.initiator_id.clone();
        ctx
    }
}

/// Reads and writes upload sessions.
pub struct SessionStore {
    root: PathBuf,
}

fn validate_id(id: &str) -> FsResult<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.starts_with('.') {
        return Err(FsError::BadRequest(format!("invalid upload id {:?}", id)));
    }
    Ok(())
}

impl SessionStore {
    /// Creates a store in `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the received bytes.
    pub fn bin_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Path of the session info.
    pub fn info_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.info", id))
    }

    /// Persists a new session and creates its empty bin file.
    pub fn create(&self, session: &UploadSession) -> FsResult<()> {
        validate_id(&session.id)?;
        fs::create_dir_all(&self.root)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.bin_path(&session.id))?;
        self.persist(session)
    }

    /// Writes the session info atomically.
    pub fn persist(&self, session: &UploadSession) -> FsResult<()> {
        validate_id(&session.id)?;
        let path = self.info_path(&session.id);
        let tmp = self.root.join(format!("{}.info.{}.tmp", session.id, uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(session)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Loads a session.
    pub fn get(&self, id: &str) -> FsResult<UploadSession> {
        validate_id(id)?;
        match fs::read(self.info_path(id)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FsError::NotFound(format!("upload {}", id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Every session with an info file, for reconciliation sweeps.
    pub fn list(&self) -> FsResult<Vec<UploadSession>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".info") else {
                continue;
            };
            match self.get(id) {
                Ok(s) => sessions.push(s),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!(session = id, error = %e, "skipping unreadable upload session"),
            }
        }
        Ok(sessions)
    }

    /// Appends `src` to the received bytes. `offset` must match what was
    /// received so far.
    pub fn write_chunk(&self, session: &mut UploadSession, offset: u64, src: &mut dyn Read) -> FsResult<u64> {
        if offset != session.offset {
            return Err(FsError::PreconditionFailed(format!(
                "offset mismatch: expected {}, got {}",
                session.offset, offset
            )));
        }
        let mut file = match OpenOptions::new().append(true).open(self.bin_path(&session.id)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("upload {}", session.id)))
            }
            Err(e) => return Err(e.into()),
        };
        let remaining = session.size - session.offset;
        let n = io::copy(&mut src.take(remaining), &mut file)?;
        session.offset += n;
        self.persist(session)?;
        Ok(n)
    }

    /// Opens the received bytes.
    pub fn open_bin(&self, id: &str) -> FsResult<File> {
        Ok(File::open(self.bin_path(id))?)
    }

    /// Removes the received bytes.
    pub fn remove_bin(&self, id: &str) -> FsResult<()> {
        remove_if_exists(&self.bin_path(id))
    }

    /// Removes the session info.
    pub fn remove_info(&self, id: &str) -> FsResult<()> {
        remove_if_exists(&self.info_path(id))
    }
}

fn remove_if_exists(path: &Path) -> FsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn blake3_file(path: &Path) -> FsResult<String> {
    let mut hasher = blake3::Hasher::new();
    let mut f = File::open(path)?;
    io::copy(&mut f, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

impl Decomposedfs {
    /// Starts an upload of `size` bytes to the referenced file and returns
    /// the session id.
    pub fn initiate_upload(
        &self,
        ctx: &OpContext,
        reference: &Reference,
        size: u64,
        options: UploadOptions,
    ) -> FsResult<String> {
        let _enter = ctx.span().enter();
        let n = match self.lu.node_from_resource(reference) {
            Ok(n) => n,
            Err(FsError::NotFound(p)) => {
                return Err(FsError::PreconditionFailed(format!("parent of {} does not exist", p)))
            }
            Err(e) => return Err(e),
        };
        if n.exists && n.is_dir() {
            return Err(FsError::BadRequest(format!("{} is not a file", reference)));
        }
        if !n.exists && n.parent_id.is_empty() {
            return Err(FsError::NotFound(reference.to_string()));
        }

        let rp = self.permissions.assemble_permissions(&ctx.user, &n)?;
        authorize(rp, PermissionSet::INITIATE_FILE_UPLOAD, &reference.to_string())?;
        if n.exists {
            n.check_lock(ctx)?;
        }

        let root = n.space_root()?;
        let used = root.tree_size().unwrap_or(0);
        let q = root.xattr_string(attrs::QUOTA).ok();
        quota::check(q.as_deref(), used, n.exists, n.blobsize.max(0) as u64, size)?;

        let session = UploadSession {
            id: uuid::Uuid::new_v4().to_string(),
            space_id: n.space_id.clone(),
            node_id: n.id.clone(),
            parent_id: n.parent_id.clone(),
            filename: n.name.clone(),
            size,
            offset: 0,
            node_exists: n.exists,
            executant: ctx.user.id.clone(),
            lock_id: ctx.lock_id.clone(),
            initiator_id: ctx.initiator_id.clone(),
            mtime: options.mtime,
            preconditions: options.preconditions,
            created: Utc::now(),
            expires: options.expires,
            size_diff: 0,
            versions_path: None,
            checksum: None,
            scan: None,
            state: ProcessingState::Created,
        };
        self.sessions.create(&session)?;
        info!(session = %session.id, space_id = %session.space_id, node_id = %session.node_id, size, "upload initiated");
        Ok(session.id)
    }

    /// Appends bytes to an upload and returns how many were written.
    pub fn write_chunk(&self, ctx: &OpContext, upload_id: &str, offset: u64, src: &mut dyn Read) -> FsResult<u64> {
        let _enter = ctx.span().enter();
        let _guard = self.session_lock(upload_id);
        let mut session = self.sessions.get(upload_id)?;
        if session.executant != ctx.user.id {
            return Err(FsError::NotFound(format!("upload {}", upload_id)));
        }
        if session.state != ProcessingState::Created {
            return Err(FsError::PreconditionFailed(format!("upload {} is already finished", upload_id)));
        }
        self.sessions.write_chunk(&mut session, offset, src)
    }

    /// Completes an upload once all bytes arrived.
    ///
    /// Prepares the node, propagates the size change and hands the upload
    /// to postprocessing, or finalizes it directly for synchronous
    /// uploads and empty files.
    pub fn finish_upload(&self, ctx: &OpContext, upload_id: &str) -> FsResult<()> {
        let _enter = ctx.span().enter();
        let _guard = self.session_lock(upload_id);
        let mut session = self.sessions.get(upload_id)?;
        if session.executant != ctx.user.id {
            return Err(FsError::NotFound(format!("upload {}", upload_id)));
        }
        if session.state != ProcessingState::Created {
            return Err(FsError::PreconditionFailed(format!("upload {} is already finished", upload_id)));
        }
        if session.offset != session.size {
            return Err(FsError::PreconditionFailed(format!(
                "upload {} is incomplete: {} of {} bytes",
                upload_id, session.offset, session.size
            )));
        }

        session.checksum = Some(blake3_file(&self.sessions.bin_path(&session.id))?);
        let n = self.create_node_for_upload(&mut session)?;

        if let Err(e) = self.tree.propagate(&n, session.size_diff) {
            error!(session = %session.id, node_id = %n.id, error = %e, "could not propagate size diff");
        }

        let finalize_now = !self.options.async_uploads || session.size == 0;
        self.process(&mut session, &n, Input::BytesReceived { finalize_now })
    }

    /// Creates or updates the node an upload targets and marks it as
    /// processing.
    fn create_node_for_upload(&self, session: &mut UploadSession) -> FsResult<Node> {
        let space_root = Node::read(&self.lu, &session.space_id, &session.space_id, false)?;
        if !space_root.exists {
            return Err(FsError::NotFound(format!("space {}", session.space_id)));
        }
        let mut n = Node::new(
            &self.lu,
            &session.space_id,
            &session.node_id,
            &session.parent_id,
            &session.filename,
            NodeKind::File,
            space_root.owner.clone(),
        );
        n.blob_id = session.id.clone();
        n.blobsize = session.size as i64;
        n.check_lock(&session.context())?;

        // the node may have been created since the upload started
        let existing = Node::read(&self.lu, &session.space_id, &session.node_id, false)?;
        let _lock: MetadataLock = if existing.exists {
            session.node_exists = true;
            self.update_existing_node(session, &n, &existing, &space_root)?
        } else {
            session.node_exists = false;
            let lock = self.tree.init_new_node(&n, &space_root, session.size)?;
            session.size_diff = session.size as i64;
            lock
        };

        let mut a = Attributes::new();
        a.set_string(attrs::ID, &n.id);
        a.set_int64(attrs::TYPE, NodeKind::File.as_i64());
        a.set_string(attrs::PARENT_ID, &n.parent_id);
        a.set_string(attrs::NAME, &n.name);
        a.set_string(attrs::BLOB_ID, &n.blob_id);
        a.set_int64(attrs::BLOB_SIZE, n.blobsize);
        a.set_string(attrs::STATUS, &format!("{}{}", attrs::PROCESSING_STATUS, session.id));
        a.set_string(attrs::MTIME, &format_time(&session.mtime.unwrap_or_else(Utc::now)));
        if let Some(cs) = &session.checksum {
            a.set_string(attrs::CHECKSUM_BLAKE3, cs);
        }
        n.set_xattrs(a, false)?;
        n.exists = true;

        self.sessions.persist(session)?;
        debug!(session = %session.id, node_id = %n.id, size_diff = session.size_diff, "node prepared for upload");
        Ok(n)
    }

    /// Checks quota and preconditions for an overwrite and saves the
    /// replaced content attributes as a version record.
    fn update_existing_node(
        &self,
        session: &mut UploadSession,
        n: &Node,
        old: &Node,
        space_root: &Node,
    ) -> FsResult<MetadataLock> {
        let backend = self.lu.metadata_backend();
        let target = n.internal_path();
        let lock = backend.lock(&target);

        let used = space_root.tree_size().unwrap_or(0);
        let q = space_root.xattr_string(attrs::QUOTA).ok();
        quota::check(q.as_deref(), used, true, old.blobsize.max(0) as u64, session.size)?;

        let old_mtime = old.mtime()?;
        session
            .preconditions
            .check(&calculate_etag(&old.id, &old.tmtime()?), &old_mtime)?;

        let version_id = format!("{}{}{}", old.id, REVISION_ID_DELIMITER, format_time(&old_mtime));
        let version_path = self.lu.internal_path(&session.space_id, &version_id);
        match OpenOptions::new().write(true).create_new(true).open(&version_path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // a revision with this mtime exists, drop its blob unless the
                // node still points at it
                let stale = backend.get_string(&version_path, attrs::BLOB_ID).unwrap_or_default();
                if !stale.is_empty() && stale != old.blob_id {
                    let mut r = old.clone();
                    r.blob_id = stale;
                    self.tree.delete_blob(&r)?;
                }
                backend.purge(&version_path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let mut content = Attributes::new();
        for (k, v) in backend.all(&target)?.iter() {
            if attrs::is_content_attr(k) {
                content.set(k.clone(), v.clone());
            }
        }
        backend.set_multiple(&version_path, content, true)?;

        session.versions_path = Some(version_path);
        session.size_diff = session.size as i64 - old.blobsize;
        Ok(lock)
    }

    /// Writes the upload's bytes as the node's blob. Repeating it is
    /// harmless.
    pub(crate) fn finalize_upload(&self, session: &UploadSession) -> FsResult<()> {
        let mut revision = Node::new(
            &self.lu,
            &session.space_id,
            &session.node_id,
            "",
            "",
            NodeKind::File,
            None,
        );
        revision.blob_id = session.id.clone();
        revision.blobsize = session.size as i64;
        self.tree.write_blob(&revision, &self.sessions.bin_path(&session.id))
    }

    /// Reverts node metadata, removes upload artifacts and drops the
    /// processing status, as requested.
    pub(crate) fn cleanup_upload(&self, session: &UploadSession, revert: bool, keep_upload: bool, unmark: bool) {
        let n = Node::read(&self.lu, &session.space_id, &session.node_id, true);
        if revert {
            match &n {
                Ok(n) if n.exists => {
                    if let (true, Some(p)) = (session.node_exists, &session.versions_path) {
                        self.restore_version(n, p);
                    } else if n.processing_id().ok().as_deref() == Some(session.id.as_str()) {
                        if let Err(e) = n.purge() {
                            error!(session = %session.id, node_id = %n.id, error = %e, "purging node failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => error!(session = %session.id, error = %e, "reading node for session failed"),
            }
        }

        if !keep_upload {
            if let Err(e) = self.sessions.remove_bin(&session.id) {
                error!(session = %session.id, error = %e, "removing upload failed");
            }
            if let Err(e) = self.sessions.remove_info(&session.id) {
                error!(session = %session.id, error = %e, "removing upload info failed");
            }
        }

        if unmark {
            if let Ok(n) = &n {
                if n.exists {
                    if let Err(e) = n.unmark_processing(&session.id) {
                        error!(session = %session.id, node_id = %n.id, error = %e, "unmarking processing failed");
                    }
                }
            }
        }
    }

    fn restore_version(&self, n: &Node, version_path: &Path) {
        let backend = self.lu.metadata_backend();
        let result = backend.all(version_path).and_then(|a| {
            let mut content = Attributes::new();
            for (k, v) in a.iter() {
                if attrs::is_content_attr(k) {
                    content.set(k.clone(), v.clone());
                }
            }
            // a checksum the old content never had must not survive
            let _lock = backend.lock(&n.internal_path());
            if !content.contains(attrs::CHECKSUM_BLAKE3) {
                backend.remove(&n.internal_path(), attrs::CHECKSUM_BLAKE3, false)?;
            }
            backend.set_multiple(&n.internal_path(), content, false)
        });
        if let Err(e) = result {
            info!(version = %version_path.display(), node_id = %n.id, error = %e, "restoring version failed");
            return;
        }
        if let Err(e) = remove_if_exists(version_path).and_then(|_| backend.purge(version_path)) {
            info!(version = %version_path.display(), node_id = %n.id, error = %e, "error removing version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(id: &str, size: u64) -> UploadSession {
        UploadSession {
            id: id.to_string(),
            space_id: "s".to_string(),
            node_id: "n".to_string(),
            parent_id: "s".to_string(),
            filename: "f.txt".to_string(),
            size,
            offset: 0,
            node_exists: false,
            executant: UserId::new("alice"),
            lock_id: None,
            initiator_id: None,
            mtime: None,
            preconditions: Preconditions::default(),
            created: Utc::now(),
            expires: None,
            size_diff: 0,
            versions_path: None,
            checksum: None,
            scan: None,
            state: ProcessingState::Created,
        }
    }

    #[test]
    fn test_create_get_list() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.create(&session("u1", 3)).unwrap();
        store.create(&session("u2", 3)).unwrap();
        assert!(store.bin_path("u1").exists());
        let s = store.get("u1").unwrap();
        assert_eq!(s.filename, "f.txt");
        assert_eq!(store.list().unwrap().len(), 2);
        assert!(store.get("nope").unwrap_err().is_not_found());
        assert!(store.create(&session("u1", 3)).is_err());
    }

    #[test]
    fn test_invalid_ids() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        for id in ["", "../x", "a/b", ".hidden"] {
            match store.get(id) {
                Err(FsError::BadRequest(_)) => {}
                other => panic!("expected BadRequest for {:?}, got {:?}", id, other.map(|s| s.id)),
            }
        }
    }

    #[test]
    fn test_write_chunk_offsets() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut s = session("u1", 5);
        store.create(&s).unwrap();

        assert_eq!(store.write_chunk(&mut s, 0, &mut &b"hel"[..]).unwrap(), 3);
        match store.write_chunk(&mut s, 0, &mut &b"lo"[..]) {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
        // bytes beyond the announced size are ignored
        assert_eq!(store.write_chunk(&mut s, 3, &mut &b"lo!!"[..]).unwrap(), 2);
        assert_eq!(fs::read(store.bin_path("u1")).unwrap(), b"hello");
        assert_eq!(store.get("u1").unwrap().offset, 5);
    }

    #[test]
    fn test_remove_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.create(&session("u1", 0)).unwrap();
        store.remove_bin("u1").unwrap();
        store.remove_info("u1").unwrap();
        store.remove_info("u1").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_preconditions() {
        let now = Utc::now();
        let p = Preconditions {
            if_match: Some("\"a\"".to_string()),
            ..Default::default()
        };
        assert!(p.check("\"a\"", &now).is_ok());
        assert!(p.check("\"b\"", &now).is_err());

        let p = Preconditions {
            if_none_match: Some("*".to_string()),
            ..Default::default()
        };
        assert!(p.check("\"a\"", &now).is_err());

        let p = Preconditions {
            if_none_match: Some("\"x\", \"a\"".to_string()),
            ..Default::default()
        };
        assert!(p.check("\"a\"", &now).is_err());
        assert!(p.check("\"b\"", &now).is_ok());

        let p = Preconditions {
            if_unmodified_since: Some(now - chrono::Duration::seconds(5)),
            ..Default::default()
        };
        assert!(p.check("\"a\"", &now).is_err());
        assert!(p.check("\"a\"", &(now - chrono::Duration::seconds(10))).is_ok());
    }

    #[test]
    fn test_blake3_file() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("f");
        fs::write(&p, b"abc").unwrap();
        assert_eq!(blake3_file(&p).unwrap(), blake3::hash(b"abc").to_hex().to_string());
    }
}
