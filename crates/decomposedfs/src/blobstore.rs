//! Storage for immutable file content.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::lookup::pathify;
use crate::node::Node;

/// Write-once content store keyed by `(space_id, blob_id)`.
pub trait Blobstore: Send + Sync {
    /// Stores the content of `source` as the blob of `node`.
    fn upload(&self, node: &Node, source: &Path) -> FsResult<()>;

    /// Opens the blob of `node` for reading.
    fn download(&self, node: &Node) -> FsResult<Box<dyn Read + Send>>;

    /// Deletes the blob of `node`. Missing blobs are not an error.
    fn delete(&self, node: &Node) -> FsResult<()>;
}

/// Blobstore keeping blobs as files below each space directory.
pub struct FsBlobstore {
    root: PathBuf,
}

impl FsBlobstore {
    /// Creates a blobstore below the storage root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a blob.
    pub fn blob_path(&self, space_id: &str, blob_id: &str) -> PathBuf {
        self.root
            .join("spaces")
            .join(pathify(space_id, 1, 2))
            .join("blobs")
            .join(pathify(blob_id, 4, 2))
    }

    fn path_for(&self, node: &Node) -> FsResult<PathBuf> {
        if node.blob_id.is_empty() {
            return Err(FsError::NotFound(format!("node {} has no blob", node.id)));
        }
        Ok(self.blob_path(&node.space_id, &node.blob_id))
    }
}

impl Blobstore for FsBlobstore {
    fn upload(&self, node: &Node, source: &Path) -> FsResult<()> {
        let dest = self.path_for(node)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = dest.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::copy(source, &tmp)?;
        fs::rename(&tmp, &dest)?;
        debug!(space_id = %node.space_id, blob_id = %node.blob_id, "stored blob");
        Ok(())
    }

    fn download(&self, node: &Node) -> FsResult<Box<dyn Read + Send>> {
        let path = self.path_for(node)?;
        match File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(FsError::NotFound(format!("blob {}", node.blob_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, node: &Node) -> FsResult<()> {
        if node.blob_id.is_empty() {
            return Ok(());
        }
        match fs::remove_file(self.blob_path(&node.space_id, &node.blob_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
