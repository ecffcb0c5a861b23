//! Static credentials for HTTP authentication challenges

use std::collections::HashMap;
use std::sync::Arc;

use crate::challenge::{Challenge, ChallengeCompletion, ChallengeDisposition, Credential};
use crate::policy::{DefaultTrustPolicy, TrustPolicy};

/// Answers `401` challenges with a per-host credential and hands server
/// trust challenges to an inner policy.
///
/// A credential is offered once per task; if the server rejects it the
/// challenge is cancelled instead of looping.
pub struct StaticCredentials {
    credentials: HashMap<String, Credential>,
    server_trust: Arc<dyn TrustPolicy>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::with_server_trust(Arc::new(DefaultTrustPolicy))
    }

    pub fn with_server_trust(server_trust: Arc<dyn TrustPolicy>) -> Self {
        Self {
            credentials: HashMap::new(),
            server_trust,
        }
    }

    pub fn insert(&mut self, host: &str, credential: Credential) {
        self.credentials.insert(host.to_lowercase(), credential);
    }

    pub fn credential_for(&self, host: &str) -> Option<&Credential> {
        self.credentials.get(&host.to_lowercase())
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustPolicy for StaticCredentials {
    fn handle_challenge(
        &self,
        session_identifier: &str,
        challenge: &Challenge,
        completion: ChallengeCompletion,
    ) {
        match challenge {
            Challenge::ServerTrust { .. } => {
                self.server_trust
                    .handle_challenge(session_identifier, challenge, completion);
            }
            Challenge::HttpAuthentication {
                host,
                previous_failure_count,
                ..
            } => match self.credential_for(host) {
                Some(_) if *previous_failure_count > 0 => {
                    tracing::warn!(
                        session_id = %session_identifier,
                        host = %host,
                        "Stored credential rejected, cancelling challenge"
                    );
                    completion.complete(ChallengeDisposition::Cancel);
                }
                Some(credential) => {
                    completion.complete(ChallengeDisposition::UseCredential(credential.clone()));
                }
                None => completion.complete(ChallengeDisposition::PerformDefaultHandling),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinning::PinnedCertificates;

    fn auth(host: &str, previous_failure_count: u32) -> Challenge {
        Challenge::HttpAuthentication {
            host: host.to_string(),
            port: 443,
            scheme: "Basic".to_string(),
            realm: Some("files".to_string()),
            previous_failure_count,
        }
    }

    fn answer(policy: &dyn TrustPolicy, challenge: Challenge) -> ChallengeDisposition {
        let (completion, mut rx) = ChallengeCompletion::channel();
        policy.handle_challenge("ferry_test", &challenge, completion);
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_credential_offered_once() {
        let mut policy = StaticCredentials::new();
        let credential = Credential::Basic {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        policy.insert("Files.Example.com", credential.clone());

        assert_eq!(
            answer(&policy, auth("files.example.com", 0)),
            ChallengeDisposition::UseCredential(credential)
        );
        assert_eq!(
            answer(&policy, auth("files.example.com", 1)),
            ChallengeDisposition::Cancel
        );
        assert_eq!(
            answer(&policy, auth("other.example.com", 0)),
            ChallengeDisposition::PerformDefaultHandling
        );
    }

    #[test]
    fn test_server_trust_goes_to_inner_policy() {
        let mut pins = PinnedCertificates::new();
        pins.add_certificate("files.example.com", b"leaf").unwrap();
        let policy = StaticCredentials::with_server_trust(Arc::new(pins));

        let challenge = Challenge::ServerTrust {
            host: "files.example.com".to_string(),
            port: 443,
            leaf_certificate: Some(b"someone-else".to_vec()),
        };
        assert_eq!(answer(&policy, challenge), ChallengeDisposition::Cancel);
    }
}
