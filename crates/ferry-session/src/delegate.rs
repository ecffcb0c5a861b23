//! Session delegate contract and the serial event queue that drives it
//!
//! Every session owns one dispatcher task. Transfers push events into its
//! channel and the dispatcher calls the delegate one event at a time, so
//! callbacks for a session never overlap and arrive in the order produced.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use ferry_trust::{Challenge, ChallengeCompletion, ChallengeDisposition};

use crate::error::TransferError;
use crate::identifier::SessionIdentifier;
use crate::session::SessionState;
use crate::task::DownloadTask;

/// Receives session events. Calls happen on the session's dispatcher and
/// should return promptly; long work belongs on another task.
pub trait SessionDelegate: Send + Sync {
    /// The body was stored at `location`. The file is removed once this
    /// returns, so it must be moved or read here.
    fn did_finish_downloading(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        location: &Path,
    );

    /// Final event of every task. `error` is `None` after a successful
    /// download, which was already reported by `did_finish_downloading`.
    fn did_complete(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        error: Option<&TransferError>,
    );

    /// All queued events were delivered and no task is outstanding.
    fn did_finish_events(&self, session: &SessionIdentifier);

    fn did_receive_challenge(
        &self,
        _session: &SessionIdentifier,
        _task: &DownloadTask,
        _challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        completion.complete(ChallengeDisposition::PerformDefaultHandling);
    }

    /// Last event of an invalidated session.
    fn did_become_invalid(&self, _session: &SessionIdentifier) {}
}

pub(crate) enum SessionEvent {
    FinishedDownloading {
        task: DownloadTask,
        location: PathBuf,
    },
    Completed {
        task: DownloadTask,
        error: Option<TransferError>,
    },
    Challenge {
        task: DownloadTask,
        challenge: Challenge,
        completion: ChallengeCompletion,
    },
    Invalidated,
}

pub(crate) async fn run_dispatcher(
    state: Arc<SessionState>,
    delegate: Arc<dyn SessionDelegate>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let session = state.identifier.clone();
    // Set once the invalidation marker was dequeued; every cancellation
    // queued by `invalidate_and_cancel` is ahead of it.
    let mut invalidating = false;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::FinishedDownloading { task, location } => {
                delegate.did_finish_downloading(&session, &task, &location);

                if let Err(e) = std::fs::remove_file(&location) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!(
                            session_id = %session,
                            task_id = task.id(),
                            error = %e,
                            "Failed to remove delivered download"
                        );
                    }
                }
            }
            SessionEvent::Completed { task, error } => {
                task.mark_completed();
                state.forget_task(task.id());

                delegate.did_complete(&session, &task, error.as_ref());

                let remaining = state.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    if invalidating {
                        delegate.did_become_invalid(&session);
                        break;
                    }
                    if state.sends_launch_events && !state.invalidated.load(Ordering::SeqCst) {
                        delegate.did_finish_events(&session);
                    }
                }
            }
            SessionEvent::Challenge {
                task,
                challenge,
                completion,
            } => {
                tracing::debug!(
                    session_id = %session,
                    task_id = task.id(),
                    challenge = challenge.kind(),
                    host = %challenge.host(),
                    "Delivering authentication challenge"
                );
                delegate.did_receive_challenge(&session, &task, &challenge, completion);
            }
            SessionEvent::Invalidated => {
                if state.outstanding.load(Ordering::SeqCst) == 0 {
                    delegate.did_become_invalid(&session);
                    break;
                }
                // Running transfers still owe their cancellations
                invalidating = true;
            }
        }
    }

    tracing::debug!(session_id = %session, "Session event queue closed");
}
