//! Postprocessing of finished uploads.
//!
//! [`Decomposedfs::process`] feeds inputs through the lifecycle in
//! [`crate::processing`] and carries out the effects each transition asks
//! for. Events from the postprocessing pipeline arrive through
//! [`Decomposedfs::handle_event`], usually driven by a pool started with
//! [`spawn_consumers`].

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::FsResult;
use crate::events::{Event, EventBus, STEP_ANTIVIRUS};
use crate::fs::Decomposedfs;
use crate::metadata::MetadataLock;
use crate::node::Node;
use crate::processing::{self, Effect, Input};
use crate::upload::UploadSession;

impl Decomposedfs {
    /// Serializes work on one upload session.
    pub(crate) fn session_lock(&self, upload_id: &str) -> MetadataLock {
        self.lu.metadata_backend().lock(&self.sessions.info_path(upload_id))
    }

    /// Applies `input` to the session and executes the resulting effects
    /// until no more inputs are produced. The new state is persisted unless
    /// the session was removed.
    ///
    /// Returns the first error of a finalize or publish step. Everything
    /// else is logged.
    pub(crate) fn process(&self, session: &mut UploadSession, node: &Node, input: Input) -> FsResult<()> {
        let mut pending = vec![input];
        let mut result = Ok(());
        let mut removed = false;

        while let Some(input) = pending.pop() {
            let (next, effects) = processing::apply(session.state, &input);
            if next == session.state && effects.is_empty() {
                debug!(session = %session.id, state = ?session.state, input = ?input, "ignoring input");
                continue;
            }
            debug!(session = %session.id, from = ?session.state, to = ?next, "upload state change");
            session.state = next;

            for effect in effects {
                match effect {
                    Effect::Finalize => match self.finalize_upload(session) {
                        Ok(()) => pending.push(Input::FinalizeDone { ok: true }),
                        Err(e) => {
                            error!(session = %session.id, node_id = %session.node_id, error = %e, "could not finalize upload");
                            if result.is_ok() {
                                result = Err(e);
                            }
                            pending.push(Input::FinalizeDone { ok: false });
                        }
                    },
                    Effect::PropagateRevert => self.revert_size_diff(session, node),
                    Effect::RecordScan(scan) => {
                        session.scan = Some((scan.description.clone(), scan.scanned));
                        if let Err(e) = node.set_scan_data(&scan.description, &scan.scanned) {
                            error!(session = %session.id, node_id = %node.id, error = %e, "could not store scan result");
                        }
                    }
                    Effect::RefreshParent => self.refresh_parent(session, node),
                    Effect::Cleanup {
                        revert,
                        keep_upload,
                        unmark,
                    } => {
                        self.cleanup_upload(session, revert, keep_upload, unmark);
                        removed |= !keep_upload;
                    }
                    Effect::PublishBytesReceived => {
                        let event = Event::BytesReceived {
                            upload_id: session.id.clone(),
                            url: format!("{}/{}", self.options.data_gateway_url.trim_end_matches('/'), session.id),
                            space_owner: node.space_owner_or_manager(),
                            executing_user: session.executant.clone(),
                            resource_id: session.resource_id(),
                            filename: session.filename.clone(),
                            filesize: session.size,
                        };
                        if let Err(e) = self.events.publish(event) {
                            error!(session = %session.id, error = %e, "could not publish BytesReceived");
                            if result.is_ok() {
                                result = Err(e);
                            }
                        }
                    }
                    Effect::PublishUploadReady { failed } => {
                        let event = Event::UploadReady {
                            upload_id: session.id.clone(),
                            failed,
                            executing_user: session.executant.clone(),
                            resource_id: session.resource_id(),
                            filename: session.filename.clone(),
                            space_owner: node.space_owner_or_manager(),
                            is_version: session.is_version(),
                            timestamp: Utc::now(),
                        };
                        if let Err(e) = self.events.publish(event) {
                            error!(session = %session.id, error = %e, "could not publish UploadReady");
                        }
                    }
                }
            }
        }

        if !removed {
            self.sessions.persist(session)?;
        }
        result
    }

    /// Undoes the speculative size propagation. When a later upload took
    /// over the node its size stays and only the parent's etag is refreshed.
    fn revert_size_diff(&self, session: &UploadSession, node: &Node) {
        match node.processing_id() {
            Ok(id) if id == session.id => {
                if session.size_diff == 0 {
                    return;
                }
                if let Err(e) = self.tree.propagate(node, -session.size_diff) {
                    error!(session = %session.id, node_id = %node.id, error = %e, "could not revert size diff");
                }
            }
            _ => {
                debug!(session = %session.id, node_id = %node.id, "node owned by another session, keeping size");
                self.refresh_parent(session, node);
            }
        }
    }

    /// Touches the parent's tree modification time and propagates it.
    fn refresh_parent(&self, session: &UploadSession, node: &Node) {
        let now = Utc::now();
        let refreshed = node
            .parent()
            .and_then(|p| p.set_tmtime(Some(&now)))
            .and_then(|_| self.tree.propagate(node, 0));
        if let Err(e) = refreshed {
            error!(session = %session.id, node_id = %node.id, error = %e, "could not refresh parent");
        }
    }

    /// Handles one event of the postprocessing pipeline. Failures are
    /// logged, never returned, so a bad event cannot stall a consumer.
    pub fn handle_event(&self, event: Event) {
        let upload_id = match &event {
            Event::PostprocessingFinished { upload_id, .. }
            | Event::PostprocessingStepFinished { upload_id, .. }
            | Event::RestartPostprocessing { upload_id }
            | Event::CleanUpload { upload_id, .. } => upload_id.clone(),
            // emitted by this engine
            Event::BytesReceived { .. } | Event::UploadReady { .. } | Event::SpaceMembershipExpired { .. } => {
                trace!(event = event.name(), "skipping own event");
                return;
            }
        };

        let _guard = self.session_lock(&upload_id);
        let mut session = match self.sessions.get(&upload_id) {
            Ok(s) => s,
            Err(e) => {
                error!(session = %upload_id, event = event.name(), error = %e, "failed to get upload");
                return;
            }
        };
        let node = match Node::read(&self.lu, &session.space_id, &session.node_id, true) {
            Ok(n) => n,
            Err(e) => {
                error!(session = %upload_id, node_id = %session.node_id, error = %e, "could not read node");
                return;
            }
        };

        let input = match event {
            Event::PostprocessingFinished { outcome, .. } => {
                if !node.exists {
                    info!(session = %upload_id, node_id = %session.node_id, "node vanished during postprocessing, removing upload");
                    self.cleanup_upload(&session, false, false, false);
                    return;
                }
                Input::Finished(outcome)
            }
            Event::PostprocessingStepFinished { step, result, .. } => {
                if step != STEP_ANTIVIRUS {
                    trace!(session = %upload_id, step = %step, "ignoring postprocessing step");
                    return;
                }
                match result {
                    Some(scan) if scan.error.is_none() => Input::ScanFinished(scan),
                    Some(scan) => {
                        warn!(session = %upload_id, error = ?scan.error, "virus scan failed");
                        return;
                    }
                    None => {
                        warn!(session = %upload_id, "antivirus step finished without result");
                        return;
                    }
                }
            }
            Event::RestartPostprocessing { .. } => Input::Restart,
            Event::CleanUpload { keep_upload, .. } => Input::Clean { keep_upload },
            _ => return,
        };

        if let Err(e) = self.process(&mut session, &node, input) {
            error!(session = %upload_id, error = %e, "processing upload event failed");
        }
    }
}

/// A running pool of event consumers.
pub struct Consumers {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Consumers {
    /// Number of worker tasks.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stops all workers once their current event is handled.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for w in self.workers {
            if let Err(e) = w.await {
                error!(error = %e, "event consumer failed");
            }
        }
    }
}

/// Starts `workers` tasks that handle the events published on `bus`.
///
/// The workers share one subscription, so each event is handled once.
/// Handlers run on the blocking pool because they do file I/O.
pub fn spawn_consumers(fs: Arc<Decomposedfs>, bus: &EventBus, workers: usize) -> Consumers {
    let rx = Arc::new(Mutex::new(bus.subscribe()));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let handles = (0..workers.max(1))
        .map(|worker| {
            let fs = fs.clone();
            let rx = rx.clone();
            let mut stop = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = stop.changed() => break,
                        next = async { rx.lock().await.recv().await } => next,
                    };
                    match next {
                        Ok(event) => {
                            let fs = fs.clone();
                            if let Err(e) = tokio::task::spawn_blocking(move || fs.handle_event(event)).await {
                                error!(worker, error = %e, "event handler panicked");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(worker, skipped, "event consumer lagged, events were dropped")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!(worker, "event consumer stopped");
            })
        })
        .collect();

    Consumers {
        shutdown,
        workers: handles,
    }
}
