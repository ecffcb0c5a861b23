//! Host application collaborator
//!
//! When the process is woken to finish background transfers, the host hands
//! over an acknowledgment that must run once all events were delivered.

use parking_lot::Mutex;

pub type BackgroundCompletion = Box<dyn FnOnce() + Send + 'static>;

pub trait HostApplication: Send + Sync {
    /// Take the pending acknowledgment, if the host holds one.
    fn take_background_completion(&self) -> Option<BackgroundCompletion>;
}

/// A host without background relaunch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHost;

impl HostApplication for NoHost {
    fn take_background_completion(&self) -> Option<BackgroundCompletion> {
        None
    }
}

/// Holds at most one acknowledgment; setting a new one replaces the old.
#[derive(Default)]
pub struct PendingBackgroundCompletion {
    slot: Mutex<Option<BackgroundCompletion>>,
}

impl PendingBackgroundCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, completion: BackgroundCompletion) {
        *self.slot.lock() = Some(completion);
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl HostApplication for PendingBackgroundCompletion {
    fn take_background_completion(&self) -> Option<BackgroundCompletion> {
        self.slot.lock().take()
    }
}
