//! Client visible node locks.
//!
//! A lock is a JSON document stored next to the node in `<node>.lock`. Lock
//! file changes are serialized through the node's metadata lock. Expired
//! locks are removed lazily whenever they are read.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::node::Node;
use crate::types::{OpContext, UserId};

/// A lock held on a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Opaque id presented by the holder on every write.
    pub lock_id: String,
    /// User holding the lock.
    pub user: Option<UserId>,
    /// Application that took the lock.
    #[serde(default)]
    pub app_name: String,
    /// When the lock expires. Never, if unset.
    pub expiration: Option<DateTime<Utc>>,
}

impl Lock {
    /// Creates a lock without expiration.
    pub fn new(lock_id: impl Into<String>, user: UserId) -> Self {
        Self {
            lock_id: lock_id.into(),
            user: Some(user),
            app_name: String::new(),
            expiration: None,
        }
    }

    /// Sets the expiration time.
    pub fn expires_at(mut self, t: DateTime<Utc>) -> Self {
        self.expiration = Some(t);
        self
    }

    /// Returns true once the expiration time has passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.expiration, Some(t) if t <= Utc::now())
    }
}

fn write_lock_file(path: &Path, lock: &Lock) -> FsResult<()> {
    let bytes = serde_json::to_vec(lock)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_lock_file(path: &Path) -> FsResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Node {
    /// Reads the current lock. Missing and expired locks are `NotFound`.
    pub fn read_lock(&self) -> FsResult<Lock> {
        let path = self.lock_file_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FsError::NotFound("no lock found".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let lock: Lock = serde_json::from_slice(&raw)?;
        if lock.is_expired() {
            debug!(node_id = %self.id, lock_id = %lock.lock_id, "removing expired lock");
            if let Err(e) = remove_lock_file(&path) {
                warn!(node_id = %self.id, error = %e, "could not remove expired lock");
            }
            return Err(FsError::NotFound("no lock found".to_string()));
        }
        Ok(lock)
    }

    /// Locks the node. Fails if a live lock exists.
    pub fn set_lock(&self, lock: &Lock) -> FsResult<()> {
        let _guard = self
            .lookup()
            .metadata_backend()
            .lock(&self.internal_path());
        match self.read_lock() {
            Ok(existing) => {
                return Err(FsError::PreconditionFailed(format!(
                    "node is locked by {}",
                    existing.lock_id
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        write_lock_file(&self.lock_file_path(), lock)
    }

    /// Replaces the lock identified by `existing_lock_id`, or by the new
    /// lock's id when empty.
    pub fn refresh_lock(&self, ctx: &OpContext, lock: &Lock, existing_lock_id: &str) -> FsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(FsError::BadRequest("missing lock id".to_string()));
        }
        let _guard = self
            .lookup()
            .metadata_backend()
            .lock(&self.internal_path());
        let current = match self.read_lock() {
            Ok(l) => l,
            Err(e) if e.is_not_found() => {
                return Err(FsError::PreconditionFailed("lock does not exist".to_string()))
            }
            Err(e) => return Err(e),
        };
        let expected = if existing_lock_id.is_empty() {
            &lock.lock_id
        } else {
            existing_lock_id
        };
        if current.lock_id != *expected {
            return Err(FsError::PreconditionFailed("mismatching lock id".to_string()));
        }
        if current.user.as_ref() != Some(&ctx.user.id) {
            return Err(FsError::PermissionDenied("cannot refresh lock of another holder".to_string()));
        }
        write_lock_file(&self.lock_file_path(), lock)
    }

    /// Removes the lock.
    pub fn unlock(&self, ctx: &OpContext, lock: &Lock) -> FsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(FsError::BadRequest("missing lock id".to_string()));
        }
        let _guard = self
            .lookup()
            .metadata_backend()
            .lock(&self.internal_path());
        let current = match self.read_lock() {
            Ok(l) => l,
            Err(e) if e.is_not_found() => {
                return Err(FsError::PreconditionFailed("lock does not exist".to_string()))
            }
            Err(e) => return Err(e),
        };
        if current.lock_id != lock.lock_id {
            return Err(FsError::PreconditionFailed("mismatching lock id".to_string()));
        }
        if current.user.as_ref() != Some(&ctx.user.id) {
            return Err(FsError::PermissionDenied("cannot unlock lock of another holder".to_string()));
        }
        remove_lock_file(&self.lock_file_path())
    }

    /// Verifies the lock id presented in `ctx` against the node's lock.
    pub fn check_lock(&self, ctx: &OpContext) -> FsResult<()> {
        let on_disk = match self.read_lock() {
            Ok(l) => Some(l),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match (on_disk, ctx.lock_id.as_deref()) {
            (Some(l), None) => Err(FsError::PreconditionFailed(format!("node is locked by {}", l.lock_id))),
            (Some(l), Some(id)) if l.lock_id != id => {
                Err(FsError::PreconditionFailed("mismatching lock".to_string()))
            }
            (Some(_), Some(_)) => Ok(()),
            (None, Some(_)) => Err(FsError::PreconditionFailed("node is not locked".to_string())),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::Lookup;
    use crate::metadata::MemoryBackend;
    use crate::node::NodeKind;
    use crate::types::User;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file_node(dir: &TempDir) -> Node {
        let lu = Arc::new(Lookup::new(dir.path(), Arc::new(MemoryBackend::new())));
        let n = Node::new(&lu, "s1", "n1", "s1", "a.txt", NodeKind::File, None);
        let p = n.internal_path();
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, b"").unwrap();
        n
    }

    #[test]
    fn test_set_and_read_lock() {
        let dir = TempDir::new().unwrap();
        let n = file_node(&dir);
        assert!(n.read_lock().unwrap_err().is_not_found());
        n.set_lock(&Lock::new("l1", UserId::new("alice"))).unwrap();
        assert_eq!(n.read_lock().unwrap().lock_id, "l1");
        match n.set_lock(&Lock::new("l2", UserId::new("bob"))) {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_lock_is_removed() {
        let dir = TempDir::new().unwrap();
        let n = file_node(&dir);
        let past = Utc::now() - chrono::Duration::seconds(5);
        write_lock_file(&n.lock_file_path(), &Lock::new("old", UserId::new("a")).expires_at(past)).unwrap();
        assert!(n.read_lock().unwrap_err().is_not_found());
        assert!(!n.lock_file_path().exists());
        n.set_lock(&Lock::new("new", UserId::new("a"))).unwrap();
    }

    #[test]
    fn test_refresh_and_unlock() {
        let dir = TempDir::new().unwrap();
        let n = file_node(&dir);
        let alice = OpContext::new(User::new("alice"));
        let bob = OpContext::new(User::new("bob"));

        match n.refresh_lock(&alice, &Lock::new("", UserId::new("alice")), "") {
            Err(FsError::BadRequest(_)) => {}
            other => panic!("expected BadRequest, got {:?}", other),
        }
        match n.refresh_lock(&alice, &Lock::new("l1", UserId::new("alice")), "") {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }

        n.set_lock(&Lock::new("l1", UserId::new("alice"))).unwrap();
        n.refresh_lock(&alice, &Lock::new("l2", UserId::new("alice")), "l1").unwrap();
        assert_eq!(n.read_lock().unwrap().lock_id, "l2");

        match n.unlock(&alice, &Lock::new("l1", UserId::new("alice"))) {
            Err(FsError::PreconditionFailed(_)) => {}
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
        match n.unlock(&bob, &Lock::new("l2", UserId::new("bob"))) {
            Err(FsError::PermissionDenied(_)) => {}
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
        n.unlock(&alice, &Lock::new("l2", UserId::new("alice"))).unwrap();
        assert!(n.read_lock().unwrap_err().is_not_found());
    }

    #[test]
    fn test_check_lock() {
        let dir = TempDir::new().unwrap();
        let n = file_node(&dir);
        let plain = OpContext::new(User::new("alice"));
        let with_l1 = OpContext::new(User::new("alice")).with_lock_id("l1");
        let with_l2 = OpContext::new(User::new("alice")).with_lock_id("l2");

        n.check_lock(&plain).unwrap();
        assert!(matches!(n.check_lock(&with_l1), Err(FsError::PreconditionFailed(_))));

        n.set_lock(&Lock::new("l1", UserId::new("alice"))).unwrap();
        n.check_lock(&with_l1).unwrap();
        assert!(matches!(n.check_lock(&plain), Err(FsError::PreconditionFailed(_))));
        assert!(matches!(n.check_lock(&with_l2), Err(FsError::PreconditionFailed(_))));
    }
}
