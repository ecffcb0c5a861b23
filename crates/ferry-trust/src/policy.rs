//! Trust policy strategy

use crate::challenge::{Challenge, ChallengeCompletion, ChallengeDisposition};

/// Decides how a session answers authentication challenges.
///
/// Implementations must eventually call [`ChallengeCompletion::complete`]
/// (or drop the completion, which cancels). They may answer from another
/// thread or task; the transport waits for the answer without blocking the
/// session's event queue.
pub trait TrustPolicy: Send + Sync {
    fn handle_challenge(
        &self,
        session_identifier: &str,
        challenge: &Challenge,
        completion: ChallengeCompletion,
    );
}

/// Answers every challenge with default handling: the TLS stack's chain
/// validation decides server trust, `401` responses are delivered as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTrustPolicy;

impl TrustPolicy for DefaultTrustPolicy {
    fn handle_challenge(
        &self,
        _session_identifier: &str,
        _challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        completion.complete(ChallengeDisposition::PerformDefaultHandling);
    }
}
