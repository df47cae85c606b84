//! Error types for the decomposed filesystem engine.
//!
//! Every operation maps its failure onto a small taxonomy that the gateway
//! layer translates into protocol status codes. `PermissionDenied` is only
//! returned when the caller may know that the resource exists; otherwise the
//! operation reports `NotFound`.

use std::path::Path;

use thiserror::Error;

/// Result type alias for engine operations.
pub type FsResult<T> = Result<T, FsError>;

/// Error variants for engine operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The resource does not exist or the caller may not see it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller can see the resource but may not perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A precondition does not hold (missing parent, lock conflict, quota).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The request is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An attribute is not set on the node.
    #[error("attribute {attr} not set on {path}")]
    AttrUnset {
        /// Name of the missing attribute.
        attr: String,
        /// Internal path of the node.
        path: String,
    },

    /// The metadata backend failed.
    #[error("metadata {op} failed on {path}: {reason}")]
    Metadata {
        /// The backend operation that failed.
        op: &'static str,
        /// Internal path of the node.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation or corrupt metadata.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Returns true for `NotFound` errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    /// Returns true if the error reports a missing attribute.
    pub fn is_attr_unset(&self) -> bool {
        matches!(self, FsError::AttrUnset { .. })
    }

    pub(crate) fn metadata(op: &'static str, path: &Path, reason: impl ToString) -> Self {
        FsError::Metadata {
            op,
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn attr_unset(attr: &str, path: &Path) -> Self {
        FsError::AttrUnset {
            attr: attr.to_string(),
            path: path.display().to_string(),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = FsError::NotFound("space/node".to_string());
        assert_eq!(e.to_string(), "not found: space/node");
        let e = FsError::metadata("set", Path::new("/tmp/x"), "disk full");
        assert_eq!(e.to_string(), "metadata set failed on /tmp/x: disk full");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e: FsError = io.into();
        assert!(matches!(e, FsError::Io(_)));
        assert!(!e.is_not_found());
    }

    #[test]
    fn test_attr_unset() {
        let e = FsError::attr_unset("user.ocis.quota", Path::new("/n"));
        assert!(e.is_attr_unset());
    }
}
