//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use decomposedfs::{
    AdminPolicy, Decomposedfs, EventPublisher, MetadataBackendKind, OpContext, Options, RecordingPublisher,
    Reference, StaticUserDirectory, UploadOptions, User,
};
use tempfile::TempDir;

/// A filesystem in a temporary root with recorded events.
pub struct Harness {
    pub dir: TempDir,
    pub fs: Arc<Decomposedfs>,
    pub events: RecordingPublisher,
}

/// Users known to the directory: alice, bob (in group `staff`), carol and
/// the administrator `admin`.
pub fn users() -> StaticUserDirectory {
    StaticUserDirectory::new([
        User::new("alice"),
        User::new("bob").with_groups(["staff"]),
        User::new("carol").with_groups(["staff"]),
        User::new("admin"),
    ])
}

/// Opens a harness with the options adjusted by `configure`.
pub fn harness_with(configure: impl FnOnce(&mut Options)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut options = Options::with_root(dir.path());
    options.metadata_backend = MetadataBackendKind::File;
    configure(&mut options);
    decomposedfs::telemetry::init(&options.log);
    let events = RecordingPublisher::new();
    let publisher: Arc<dyn EventPublisher> = Arc::new(events.clone());
    let fs = Decomposedfs::new(options, Arc::new(AdminPolicy::new(["admin"])), Arc::new(users()), publisher)
        .unwrap();
    Harness {
        dir,
        fs: Arc::new(fs),
        events,
    }
}

/// Opens a harness finalizing uploads synchronously or through
/// postprocessing events.
pub fn harness(async_uploads: bool) -> Harness {
    harness_with(|o| o.async_uploads = async_uploads)
}

/// Context of a directory user.
pub fn ctx(id: &str) -> OpContext {
    let user = match id {
        "bob" | "carol" => User::new(id).with_groups(["staff"]),
        _ => User::new(id),
    };
    OpContext::new(user)
}

/// Uploads `data` in one chunk and finishes the upload. Returns the
/// session id.
pub fn upload(fs: &Decomposedfs, ctx: &OpContext, reference: &Reference, data: &[u8]) -> String {
    let id = fs
        .initiate_upload(ctx, reference, data.len() as u64, UploadOptions::default())
        .unwrap();
    let written = fs.write_chunk(ctx, &id, 0, &mut &data[..]).unwrap();
    assert_eq!(written, data.len() as u64);
    fs.finish_upload(ctx, &id).unwrap();
    id
}

/// Reads the whole content of a file.
pub fn read_all(fs: &Decomposedfs, ctx: &OpContext, reference: &Reference) -> Vec<u8> {
    let (_, mut reader) = fs.download(ctx, reference).unwrap();
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut buf).unwrap();
    buf
}
