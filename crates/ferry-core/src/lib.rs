//! Ferry Core
//!
//! Resumable background downloads behind one service handle. Transfers
//! survive network interruption and, with a journal, process restart.

mod config;
mod error;
mod service;

pub use config::Config;
pub use error::CoreError;
pub use service::{BackgroundDownloadService, ServiceBuilder};

// Re-export core components
pub use ferry_download::{
    AllTasksCompletionTarget, BackgroundCompletion, Completion, CompletionMode, CompletionTarget,
    DownloadError, HostApplication, NoHost, PendingBackgroundCompletion,
};
pub use ferry_session::{
    DirectoryProtection, DownloadTask, OwnerOnlyProtection, ResumeData, SessionError,
    SessionIdentifier, TaskState, TransferError,
};
pub use ferry_storage::{Database, StorageError, TaskJournal};
pub use ferry_trust::{
    Challenge, ChallengeCompletion, ChallengeDisposition, Credential, DefaultTrustPolicy,
    PinnedCertificates, StaticCredentials, TrustError, TrustPolicy,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
