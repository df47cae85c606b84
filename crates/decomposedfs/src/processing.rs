//! Upload session lifecycle.
//!
//! ```text
//! Created -> AwaitingScan -> Finalizing -> Finalized
//!                  |              |
//!                  +--------------+-----> Aborted | Deleted
//! ```
//!
//! [`apply`] is a pure function from a state and an input to the next
//! state plus the side effects the caller has to carry out, in order.
//! Inputs that make no sense in a state leave it unchanged and produce no
//! effects, which makes redelivered events harmless.

use serde::{Deserialize, Serialize};

use crate::events::{Outcome, ScanResult};

/// State of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ProcessingState {
    /// Bytes are still arriving.
    Created,
    /// All bytes arrived, waiting for the postprocessing decision.
    AwaitingScan,
    /// The blob is being written.
    Finalizing {
        /// True when the decision came from the postprocessing pipeline.
        postprocessed: bool,
    },
    /// The upload is the node's current content.
    Finalized,
    /// The upload was rejected or could not be finalized.
    Aborted,
    /// The upload was rejected and its bytes discarded.
    Deleted,
}

impl ProcessingState {
    /// Returns true once no further input changes the state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Finalized | ProcessingState::Deleted)
    }
}

/// Something that happened to an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The client finished sending bytes. With `finalize_now` the blob is
    /// written right away instead of waiting for postprocessing.
    BytesReceived {
        /// Skip postprocessing.
        finalize_now: bool,
    },
    /// The antivirus step finished without error.
    ScanFinished(ScanResult),
    /// Postprocessing decided.
    Finished(Outcome),
    /// Result of a [`Effect::Finalize`].
    FinalizeDone {
        /// True if the blob was written.
        ok: bool,
    },
    /// Postprocessing has to start over.
    Restart,
    /// The upload should be reverted.
    Clean {
        /// Keep bytes and session info.
        keep_upload: bool,
    },
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Announce the received bytes to postprocessing.
    PublishBytesReceived,
    /// Store the scan result on session and node.
    RecordScan(ScanResult),
    /// Write the blob. Its result is fed back as [`Input::FinalizeDone`].
    Finalize,
    /// Propagate the negative size diff if the node still belongs to this
    /// session.
    PropagateRevert,
    /// Touch the parent's tree modification time and propagate it.
    RefreshParent,
    /// Revert node metadata, remove the upload and drop the processing
    /// status, as flagged.
    Cleanup {
        /// Restore the previous content attributes or purge a new node.
        revert: bool,
        /// Keep bytes and session info.
        keep_upload: bool,
        /// Remove the node's processing status.
        unmark: bool,
    },
    /// Announce the end of the upload.
    PublishUploadReady {
        /// True if the upload did not become the node's content.
        failed: bool,
    },
}

/// Computes the next state and the effects of `input`.
pub fn apply(state: ProcessingState, input: &Input) -> (ProcessingState, Vec<Effect>) {
    use Effect::*;
    use ProcessingState::*;

    match (state, input) {
        (Created, Input::BytesReceived { finalize_now: true }) => {
            (Finalizing { postprocessed: false }, vec![Finalize])
        }
        (Created, Input::BytesReceived { finalize_now: false }) => (AwaitingScan, vec![PublishBytesReceived]),

        (AwaitingScan, Input::ScanFinished(scan)) => (AwaitingScan, vec![RecordScan(scan.clone())]),

        (AwaitingScan, Input::Finished(Outcome::Continue)) => {
            (Finalizing { postprocessed: true }, vec![Finalize])
        }
        // redelivery while the blob is written: finalize is idempotent
        (s @ Finalizing { postprocessed: true }, Input::Finished(Outcome::Continue)) => (s, vec![Finalize]),
        (AwaitingScan, Input::Finished(Outcome::Delete)) => (
            Deleted,
            vec![
                PropagateRevert,
                Cleanup {
                    revert: true,
                    keep_upload: false,
                    unmark: true,
                },
                PublishUploadReady { failed: true },
            ],
        ),
        (AwaitingScan, Input::Finished(_)) => (
            Aborted,
            vec![
                PropagateRevert,
                Cleanup {
                    revert: true,
                    keep_upload: true,
                    unmark: true,
                },
                PublishUploadReady { failed: true },
            ],
        ),

        (Finalizing { postprocessed: false }, Input::FinalizeDone { ok: true }) => (
            Finalized,
            vec![Cleanup {
                revert: false,
                keep_upload: false,
                unmark: true,
            }],
        ),
        (Finalizing { postprocessed: false }, Input::FinalizeDone { ok: false }) => (
            Deleted,
            vec![
                PropagateRevert,
                Cleanup {
                    revert: true,
                    keep_upload: false,
                    unmark: false,
                },
            ],
        ),
        (Finalizing { postprocessed: true }, Input::FinalizeDone { ok: true }) => (
            Finalized,
            vec![
                RefreshParent,
                Cleanup {
                    revert: false,
                    keep_upload: false,
                    unmark: true,
                },
                PublishUploadReady { failed: false },
            ],
        ),
        // the processing status stays so housekeeping keeps the upload
        (Finalizing { postprocessed: true }, Input::FinalizeDone { ok: false }) => (
            Aborted,
            vec![
                PropagateRevert,
                Cleanup {
                    revert: false,
                    keep_upload: true,
                    unmark: false,
                },
                PublishUploadReady { failed: true },
            ],
        ),

        (AwaitingScan | Finalizing { .. } | Aborted, Input::Restart) => (AwaitingScan, vec![PublishBytesReceived]),

        (Finalized | Deleted, Input::Clean { .. }) => (state, Vec::new()),
        (_, Input::Clean { keep_upload }) => (
            if *keep_upload { Aborted } else { Deleted },
            vec![Cleanup {
                revert: true,
                keep_upload: *keep_upload,
                unmark: true,
            }],
        ),

        (s, _) => (s, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn scan() -> ScanResult {
        ScanResult {
            description: "clean".to_string(),
            scanned: Utc::now(),
            infected: false,
            error: None,
        }
    }

    #[test]
    fn test_async_happy_path() {
        let (s, e) = apply(ProcessingState::Created, &Input::BytesReceived { finalize_now: false });
        assert_eq!(s, ProcessingState::AwaitingScan);
        assert_eq!(e, vec![Effect::PublishBytesReceived]);

        let (s, e) = apply(s, &Input::ScanFinished(scan()));
        assert_eq!(s, ProcessingState::AwaitingScan);
        assert!(matches!(e.as_slice(), [Effect::RecordScan(_)]));

        let (s, e) = apply(s, &Input::Finished(Outcome::Continue));
        assert_eq!(s, ProcessingState::Finalizing { postprocessed: true });
        assert_eq!(e, vec![Effect::Finalize]);

        let (s, e) = apply(s, &Input::FinalizeDone { ok: true });
        assert_eq!(s, ProcessingState::Finalized);
        assert_eq!(e.last(), Some(&Effect::PublishUploadReady { failed: false }));
        assert!(e.contains(&Effect::RefreshParent));
    }

    #[test]
    fn test_sync_finalize() {
        let (s, e) = apply(ProcessingState::Created, &Input::BytesReceived { finalize_now: true });
        assert_eq!(e, vec![Effect::Finalize]);
        let (s, e) = apply(s, &Input::FinalizeDone { ok: true });
        assert_eq!(s, ProcessingState::Finalized);
        assert!(!e.iter().any(|e| matches!(e, Effect::PublishUploadReady { .. })));
    }

    #[test]
    fn test_abort_and_delete() {
        let (s, e) = apply(ProcessingState::AwaitingScan, &Input::Finished(Outcome::Abort));
        assert_eq!(s, ProcessingState::Aborted);
        assert_eq!(e[0], Effect::PropagateRevert);
        assert_eq!(
            e[1],
            Effect::Cleanup {
                revert: true,
                keep_upload: true,
                unmark: true
            }
        );

        let (s, _) = apply(
            ProcessingState::AwaitingScan,
            &Input::Finished(Outcome::Unknown("weird".to_string())),
        );
        assert_eq!(s, ProcessingState::Aborted);

        let (s, e) = apply(ProcessingState::AwaitingScan, &Input::Finished(Outcome::Delete));
        assert_eq!(s, ProcessingState::Deleted);
        assert!(e.contains(&Effect::Cleanup {
            revert: true,
            keep_upload: false,
            unmark: true
        }));
    }

    #[test]
    fn test_failed_finalize_keeps_processing_status() {
        let (s, e) = apply(
            ProcessingState::Finalizing { postprocessed: true },
            &Input::FinalizeDone { ok: false },
        );
        assert_eq!(s, ProcessingState::Aborted);
        assert!(e.contains(&Effect::Cleanup {
            revert: false,
            keep_upload: true,
            unmark: false
        }));
        let (s, e) = apply(s, &Input::Restart);
        assert_eq!(s, ProcessingState::AwaitingScan);
        assert_eq!(e, vec![Effect::PublishBytesReceived]);
    }

    #[test]
    fn test_redelivered_decision_after_finalize_is_noop() {
        let (s, e) = apply(ProcessingState::Finalized, &Input::Finished(Outcome::Continue));
        assert_eq!(s, ProcessingState::Finalized);
        assert!(e.is_empty());
        let (_, e) = apply(ProcessingState::Finalized, &Input::Clean { keep_upload: false });
        assert!(e.is_empty());
    }

    #[test]
    fn test_clean_upload() {
        let (s, e) = apply(ProcessingState::AwaitingScan, &Input::Clean { keep_upload: true });
        assert_eq!(s, ProcessingState::Aborted);
        assert_eq!(
            e,
            vec![Effect::Cleanup {
                revert: true,
                keep_upload: true,
                unmark: true
            }]
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ProcessingState::Finalizing { postprocessed: true }).unwrap();
        assert_eq!(json, r#"{"state":"finalizing","postprocessed":true}"#);
        let back: ProcessingState = serde_json::from_str(r#"{"state":"awaiting_scan"}"#).unwrap();
        assert_eq!(back, ProcessingState::AwaitingScan);
    }

    fn any_state() -> impl Strategy<Value = ProcessingState> {
        prop_oneof![
            Just(ProcessingState::Created),
            Just(ProcessingState::AwaitingScan),
            any::<bool>().prop_map(|p| ProcessingState::Finalizing { postprocessed: p }),
            Just(ProcessingState::Finalized),
            Just(ProcessingState::Aborted),
            Just(ProcessingState::Deleted),
        ]
    }

    fn any_input() -> impl Strategy<Value = Input> {
        prop_oneof![
            any::<bool>().prop_map(|f| Input::BytesReceived { finalize_now: f }),
            Just(Input::Finished(Outcome::Continue)),
            Just(Input::Finished(Outcome::Abort)),
            Just(Input::Finished(Outcome::Delete)),
            any::<bool>().prop_map(|ok| Input::FinalizeDone { ok }),
            Just(Input::Restart),
            any::<bool>().prop_map(|k| Input::Clean { keep_upload: k }),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_states_are_sticky(state in any_state(), inputs in proptest::collection::vec(any_input(), 0..20)) {
            let mut s = state;
            let mut terminal = s.is_terminal();
            for input in &inputs {
                let (next, effects) = apply(s, input);
                if terminal {
                    prop_assert_eq!(next, s);
                    prop_assert!(effects.is_empty());
                }
                s = next;
                terminal = s.is_terminal();
            }
        }

        #[test]
        fn prop_at_most_one_upload_ready_per_transition(state in any_state(), input in any_input()) {
            let (_, effects) = apply(state, &input);
            let n = effects.iter().filter(|e| matches!(e, Effect::PublishUploadReady { .. })).count();
            prop_assert!(n <= 1);
        }
    }
}
