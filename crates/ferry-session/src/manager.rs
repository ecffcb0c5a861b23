//! Session manager
//!
//! Lazily creates the one background session for the process and tears it
//! down on request. Once invalidated, the manager never creates another.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::configuration::SessionConfiguration;
use crate::delegate::SessionDelegate;
use crate::error::SessionError;
use crate::identifier::SessionIdentifier;
use crate::protection::DirectoryProtection;
use crate::session::TransportSession;
use crate::Result;

pub struct SessionManager {
    configuration: SessionConfiguration,
    delegate: Arc<dyn SessionDelegate>,
    protection: Option<Arc<dyn DirectoryProtection>>,
    session: Mutex<Option<Arc<TransportSession>>>,
    invalidated: AtomicBool,
}

impl SessionManager {
    pub fn new(configuration: SessionConfiguration, delegate: Arc<dyn SessionDelegate>) -> Self {
        Self {
            configuration,
            delegate,
            protection: None,
            session: Mutex::new(None),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn with_directory_protection(mut self, protection: Arc<dyn DirectoryProtection>) -> Self {
        self.protection = Some(protection);
        self
    }

    /// The session, created on first use. Must be called from within a
    /// Tokio runtime the first time.
    pub fn get_or_create_session(&self) -> Result<Arc<TransportSession>> {
        let mut slot = self.session.lock();

        if self.invalidated.load(Ordering::SeqCst) {
            return Err(SessionError::Invalidated);
        }
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        // Best effort: the transport reports its own errors if the
        // directory is unusable.
        if std::fs::create_dir_all(&self.configuration.cache_dir).is_ok() {
            if let Some(protection) = &self.protection {
                let _ = protection.protect(&self.configuration.cache_dir);
            }
        }

        let session = TransportSession::create(
            self.configuration.clone(),
            Arc::clone(&self.delegate),
            runtime,
        )?;
        session.reattach_journaled_tasks();

        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Cancel every task of the current session and refuse to create
    /// another. A no-op when no session exists yet, apart from the refusal.
    pub fn invalidate_and_cancel(&self) {
        let session = {
            let slot = self.session.lock();
            self.invalidated.store(true, Ordering::SeqCst);
            slot.clone()
        };

        match session {
            Some(session) => session.invalidate_and_cancel(),
            None => tracing::debug!(
                session_id = %self.configuration.identifier,
                "Invalidated before any session was created"
            ),
        }
    }

    pub fn session_identifier(&self) -> &SessionIdentifier {
        &self.configuration.identifier
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identifier", &self.configuration.identifier)
            .field("created", &self.session.lock().is_some())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
