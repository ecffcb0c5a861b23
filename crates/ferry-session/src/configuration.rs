//! Session configuration

use std::path::PathBuf;
use std::time::Duration;

use ferry_storage::TaskJournal;

use crate::identifier::SessionIdentifier;
use crate::tls::SessionTls;

/// Idle timeout applied to every request unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 10);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_IDENTIFIER_PREFIX: &str = "com.ferry.background";

/// Fixed at session construction; the session never re-reads it.
#[derive(Clone)]
pub struct SessionConfiguration {
    pub identifier: SessionIdentifier,
    /// Longest a request may wait for the next piece of the response
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Deliver the all-events-flushed signal once no task is outstanding
    pub sends_launch_events: bool,
    /// Keep pooled connections around instead of reaping idle ones
    pub extended_background_idle_mode: bool,
    /// Transfer cache directory; each session writes under
    /// `<cache_dir>/<identifier>/`
    pub cache_dir: PathBuf,
    pub journal: Option<TaskJournal>,
    /// DER certificates trusted in addition to the web PKI roots
    pub root_certificates: Vec<Vec<u8>>,
}

impl SessionConfiguration {
    pub fn background(identifier: SessionIdentifier, cache_dir: PathBuf) -> Self {
        Self {
            identifier,
            request_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sends_launch_events: true,
            extended_background_idle_mode: true,
            cache_dir,
            journal: None,
            root_certificates: Vec::new(),
        }
    }

    pub fn with_journal(mut self, journal: TaskJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.root_certificates.push(der);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn session_dir(&self) -> PathBuf {
        self.cache_dir.join(self.identifier.as_str())
    }

    /// Redirects are left to the transfer so every hop gets its own trust
    /// evaluation.
    pub(crate) fn build_client(&self, tls: &SessionTls) -> reqwest::Result<reqwest::Client> {
        let pool_idle_timeout = if self.extended_background_idle_mode {
            None
        } else {
            Some(Duration::from_secs(90))
        };

        reqwest::Client::builder()
            .use_preconfigured_tls(tls.client_config())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()
    }
}

impl std::fmt::Debug for SessionConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfiguration")
            .field("identifier", &self.identifier)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("sends_launch_events", &self.sends_launch_events)
            .field(
                "extended_background_idle_mode",
                &self.extended_background_idle_mode,
            )
            .field("cache_dir", &self.cache_dir)
            .field("journal", &self.journal.is_some())
            .field("root_certificates", &self.root_certificates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_defaults() {
        let id = SessionIdentifier::generate(DEFAULT_IDENTIFIER_PREFIX);
        let config = SessionConfiguration::background(id.clone(), PathBuf::from("/cache"));

        assert_eq!(config.request_timeout, Duration::from_secs(600));
        assert!(config.sends_launch_events);
        assert!(config.extended_background_idle_mode);
        assert!(config.journal.is_none());
        assert!(config.root_certificates.is_empty());
        assert_eq!(config.session_dir(), PathBuf::from("/cache").join(id.as_str()));
    }
}
