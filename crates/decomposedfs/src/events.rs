//! Events exchanged with the postprocessing pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::types::{ResourceId, UserId};

/// Postprocessing step that scans uploads for viruses.
pub const STEP_ANTIVIRUS: &str = "antivirus";

/// Final decision of the postprocessing pipeline on an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Keep the upload.
    Continue,
    /// Reject the upload but keep its bytes for inspection.
    Abort,
    /// Reject the upload and discard its bytes.
    Delete,
    /// An outcome this engine does not know. Handled like `Abort`.
    #[serde(untagged)]
    Unknown(String),
}

/// Result of the antivirus step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Human readable scan outcome.
    pub description: String,
    /// When the scan ran.
    pub scanned: DateTime<Utc>,
    /// True if the content is infected.
    pub infected: bool,
    /// Set when the scan itself failed.
    pub error: Option<String>,
}

/// Events consumed and produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// All bytes of an upload arrived, postprocessing may start.
    BytesReceived {
        /// Upload session id.
        upload_id: String,
        /// Where postprocessing fetches the bytes.
        url: String,
        /// Owner or manager of the target space.
        space_owner: Option<UserId>,
        /// User that uploaded.
        executing_user: UserId,
        /// Target node.
        resource_id: ResourceId,
        /// Name of the uploaded file.
        filename: String,
        /// Size of the upload.
        filesize: u64,
    },
    /// One postprocessing step finished.
    PostprocessingStepFinished {
        /// Upload session id.
        upload_id: String,
        /// Name of the step.
        step: String,
        /// Scan result of the antivirus step.
        result: Option<ScanResult>,
    },
    /// Postprocessing decided on an upload.
    PostprocessingFinished {
        /// Upload session id.
        upload_id: String,
        /// The decision.
        outcome: Outcome,
        /// User that uploaded.
        executing_user: UserId,
        /// Name of the uploaded file.
        filename: String,
    },
    /// Postprocessing of an upload has to start over.
    RestartPostprocessing {
        /// Upload session id.
        upload_id: String,
    },
    /// An upload should be reverted.
    CleanUpload {
        /// Upload session id.
        upload_id: String,
        /// Keep the received bytes and session info.
        keep_upload: bool,
    },
    /// An upload completed, successfully or not.
    UploadReady {
        /// Upload session id.
        upload_id: String,
        /// True if the upload was rejected or could not be finalized.
        failed: bool,
        /// User that uploaded.
        executing_user: UserId,
        /// Target node.
        resource_id: ResourceId,
        /// Name of the uploaded file.
        filename: String,
        /// Owner or manager of the target space.
        space_owner: Option<UserId>,
        /// True if the upload replaced existing content.
        is_version: bool,
        /// When the upload was finished.
        timestamp: DateTime<Utc>,
    },
    /// A space grant expired and was removed.
    SpaceMembershipExpired {
        /// Space the grant was on.
        space_id: String,
        /// Name of the space.
        space_name: String,
        /// Principal of the grantee, `u:<id>` or `g:<id>`.
        grantee: String,
        /// When the grant expired.
        expired_at: Option<DateTime<Utc>>,
    },
}

impl Event {
    /// Upload session the event refers to, if any.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Event::BytesReceived { upload_id, .. }
            | Event::PostprocessingStepFinished { upload_id, .. }
            | Event::PostprocessingFinished { upload_id, .. }
            | Event::RestartPostprocessing { upload_id }
            | Event::CleanUpload { upload_id, .. }
            | Event::UploadReady { upload_id, .. } => Some(upload_id),
            Event::SpaceMembershipExpired { .. } => None,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::BytesReceived { .. } => "BytesReceived",
            Event::PostprocessingStepFinished { .. } => "PostprocessingStepFinished",
            Event::PostprocessingFinished { .. } => "PostprocessingFinished",
            Event::RestartPostprocessing { .. } => "RestartPostprocessing",
            Event::CleanUpload { .. } => "CleanUpload",
            Event::UploadReady { .. } => "UploadReady",
            Event::SpaceMembershipExpired { .. } => "SpaceMembershipExpired",
        }
    }
}

/// Sink for events the engine emits.
pub trait EventPublisher: Send + Sync {
    /// Publishes one event.
    fn publish(&self, event: Event) -> FsResult<()>;
}

/// In-process event stream backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sends an event to all subscribers and returns how many got it.
    pub fn send(&self, event: Event) -> FsResult<usize> {
        if self.sender.receiver_count() == 0 {
            trace!(event = event.name(), "no subscribers, dropping event");
            return Ok(0);
        }
        self.sender
            .send(event)
            .map_err(|_| FsError::Internal("event channel closed".to_string()))
    }

    /// Subscribes to all events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: Event) -> FsResult<()> {
        self.send(event).map(|_| ())
    }
}

/// Publisher that records every event, for tests and dry runs.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingPublisher {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Removes and returns the events published so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: Event) -> FsResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
