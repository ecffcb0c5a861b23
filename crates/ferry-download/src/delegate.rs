//! The session delegate installed by the controller: completions go to the
//! router, challenges to the trust delegate.

use std::path::Path;
use std::sync::Arc;

use ferry_session::{DownloadTask, SessionDelegate, SessionIdentifier, TransferError};
use ferry_trust::{Challenge, ChallengeCompletion};

use crate::router::CompletionRouter;
use crate::trust::TrustChallengeDelegate;

pub struct ServiceDelegate {
    router: Arc<CompletionRouter>,
    trust: TrustChallengeDelegate,
}

impl ServiceDelegate {
    pub fn new(router: Arc<CompletionRouter>, trust: TrustChallengeDelegate) -> Self {
        Self { router, trust }
    }
}

impl SessionDelegate for ServiceDelegate {
    fn did_finish_downloading(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        location: &Path,
    ) {
        self.router.did_finish_downloading(session, task, location);
    }

    fn did_complete(
        &self,
        session: &SessionIdentifier,
        task: &DownloadTask,
        error: Option<&TransferError>,
    ) {
        self.router.did_complete(session, task, error);
    }

    fn did_finish_events(&self, session: &SessionIdentifier) {
        self.router.did_finish_events(session);
    }

    fn did_receive_challenge(
        &self,
        session: &SessionIdentifier,
        _task: &DownloadTask,
        challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        self.trust.did_receive_challenge(session, challenge, completion);
    }

    fn did_become_invalid(&self, session: &SessionIdentifier) {
        tracing::info!(session_id = %session, "Download session torn down");
    }
}
