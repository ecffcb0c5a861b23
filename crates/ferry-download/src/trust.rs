//! Trust challenge delegate

use std::sync::Arc;

use ferry_session::SessionIdentifier;
use ferry_trust::{Challenge, ChallengeCompletion, DefaultTrustPolicy, TrustPolicy};

/// Hands every challenge to the injected policy unchanged. The policy owns
/// the completion and must answer it; dropping it cancels the task.
#[derive(Clone)]
pub struct TrustChallengeDelegate {
    policy: Arc<dyn TrustPolicy>,
}

impl TrustChallengeDelegate {
    pub fn new(policy: Arc<dyn TrustPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<dyn TrustPolicy> {
        &self.policy
    }

    pub fn did_receive_challenge(
        &self,
        session: &SessionIdentifier,
        challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        self.policy
            .handle_challenge(session.as_str(), challenge, completion);
    }
}

impl Default for TrustChallengeDelegate {
    fn default() -> Self {
        Self::new(Arc::new(DefaultTrustPolicy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_trust::ChallengeDisposition;
    use parking_lot::Mutex;

    struct RecordingPolicy {
        seen: Mutex<Vec<(String, Challenge)>>,
    }

    impl TrustPolicy for RecordingPolicy {
        fn handle_challenge(
            &self,
            session_identifier: &str,
            challenge: &Challenge,
            completion: ChallengeCompletion,
        ) {
            self.seen
                .lock()
                .push((session_identifier.to_string(), challenge.clone()));
            completion.complete(ChallengeDisposition::Proceed);
        }
    }

    #[tokio::test]
    async fn test_forwards_verbatim() {
        let policy = Arc::new(RecordingPolicy {
            seen: Mutex::new(Vec::new()),
        });
        let delegate = TrustChallengeDelegate::new(policy.clone());

        let challenge = Challenge::ServerTrust {
            host: "example.com".to_string(),
            port: 443,
            leaf_certificate: Some(vec![1, 2, 3]),
        };
        let (completion, answer) = ChallengeCompletion::channel();
        let session = SessionIdentifier::from_existing("ferry_X");
        delegate.did_receive_challenge(&session, &challenge, completion);

        assert_eq!(answer.await.unwrap(), ChallengeDisposition::Proceed);
        assert_eq!(
            *policy.seen.lock(),
            vec![("ferry_X".to_string(), challenge)]
        );
    }

    #[tokio::test]
    async fn test_default_policy_performs_default_handling() {
        let (completion, answer) = ChallengeCompletion::channel();
        TrustChallengeDelegate::default().did_receive_challenge(
            &SessionIdentifier::from_existing("ferry_Y"),
            &Challenge::ServerTrust {
                host: "example.com".to_string(),
                port: 443,
                leaf_certificate: None,
            },
            completion,
        );

        assert_eq!(answer.await.unwrap(), ChallengeDisposition::PerformDefaultHandling);
    }
}
