//! Completion values and targets

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use ferry_session::{SessionIdentifier, TransferError};

/// Outcome handed to a completion target. On success `location` is the
/// temporary file, valid only for the duration of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub success: bool,
    pub location: Option<PathBuf>,
    pub url: Option<Url>,
    pub error: Option<TransferError>,
}

impl Completion {
    pub fn succeeded(location: PathBuf, url: Url) -> Self {
        Self {
            success: true,
            location: Some(location),
            url: Some(url),
            error: None,
        }
    }

    pub fn failed(url: Url, error: TransferError) -> Self {
        Self {
            success: false,
            location: None,
            url: Some(url),
            error: Some(error),
        }
    }
}

/// Called once with the outcome of a task.
pub type CompletionTarget = Arc<dyn Fn(Completion) + Send + Sync>;

/// Called when the session reports all background events delivered.
pub type AllTasksCompletionTarget = Arc<dyn Fn(&SessionIdentifier) + Send + Sync>;

/// How completion targets are associated with tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Each task keeps the target it was started with
    #[default]
    PerTask,
    /// One target for the whole service; every `start` replaces it
    Shared,
}
