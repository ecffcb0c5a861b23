//! Challenge model

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A request from the transport to validate a peer or supply credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// TLS handshake finished and the platform accepted the chain
    ServerTrust {
        host: String,
        port: u16,
        /// DER encoding of the peer's leaf certificate, when the TLS stack exposes it
        leaf_certificate: Option<Vec<u8>>,
    },
    /// The server answered `401 Unauthorized`
    HttpAuthentication {
        host: String,
        port: u16,
        scheme: String,
        realm: Option<String>,
        /// How many credentials were already rejected for this task
        previous_failure_count: u32,
    },
}

impl Challenge {
    pub fn host(&self) -> &str {
        match self {
            Challenge::ServerTrust { host, .. } => host,
            Challenge::HttpAuthentication { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Challenge::ServerTrust { port, .. } => *port,
            Challenge::HttpAuthentication { port, .. } => *port,
        }
    }

    pub fn is_server_trust(&self) -> bool {
        matches!(self, Challenge::ServerTrust { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Challenge::ServerTrust { .. } => "server_trust",
            Challenge::HttpAuthentication { .. } => "http_authentication",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Accept the presented server trust
    ServerTrust,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ServerTrust => write!(f, "ServerTrust"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Continue the transfer as-is
    Proceed,
    /// Abort the task
    Cancel,
    /// Continue using the given credential
    UseCredential(Credential),
    /// Let the transport do what it would do without a policy
    PerformDefaultHandling,
}

impl ChallengeDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeDisposition::Proceed => "proceed",
            ChallengeDisposition::Cancel => "cancel",
            ChallengeDisposition::UseCredential(_) => "use_credential",
            ChallengeDisposition::PerformDefaultHandling => "perform_default_handling",
        }
    }
}

/// Answer slot handed to a policy along with a challenge.
///
/// `complete` consumes the value, so a challenge is answered at most once.
/// Dropping it without answering resolves the challenge as
/// [`ChallengeDisposition::Cancel`].
pub struct ChallengeCompletion {
    sender: Option<oneshot::Sender<ChallengeDisposition>>,
}

impl ChallengeCompletion {
    pub fn channel() -> (Self, oneshot::Receiver<ChallengeDisposition>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn complete(mut self, disposition: ChallengeDisposition) {
        if let Some(sender) = self.sender.take() {
            // The task may already be gone (cancelled); nothing to tell it then.
            let _ = sender.send(disposition);
        }
    }
}

impl Drop for ChallengeCompletion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::warn!("Challenge dropped without an answer, cancelling");
            let _ = sender.send(ChallengeDisposition::Cancel);
        }
    }
}

impl std::fmt::Debug for ChallengeCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCompletion")
            .field("answered", &self.sender.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_delivers_disposition() {
        let (completion, mut rx) = ChallengeCompletion::channel();
        completion.complete(ChallengeDisposition::Proceed);
        assert_eq!(rx.try_recv().unwrap(), ChallengeDisposition::Proceed);
    }

    #[test]
    fn test_drop_without_answer_cancels() {
        let (completion, mut rx) = ChallengeCompletion::channel();
        drop(completion);
        assert_eq!(rx.try_recv().unwrap(), ChallengeDisposition::Cancel);
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let credential = Credential::Basic {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
