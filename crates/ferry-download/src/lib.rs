//! Ferry Download
//!
//! The caller-facing half of the service:
//! - `DownloadController` issues tasks on the background session
//! - `CompletionRouter` delivers each task's outcome to its target
//! - `TrustChallengeDelegate` hands trust and auth challenges to a policy

mod completion;
mod controller;
mod delegate;
mod error;
mod host;
mod main_queue;
mod router;
mod trust;

pub use completion::{AllTasksCompletionTarget, Completion, CompletionMode, CompletionTarget};
pub use controller::DownloadController;
pub use delegate::ServiceDelegate;
pub use error::DownloadError;
pub use host::{BackgroundCompletion, HostApplication, NoHost, PendingBackgroundCompletion};
pub use main_queue::{Job, MainQueue};
pub use router::CompletionRouter;
pub use trust::TrustChallengeDelegate;

pub type Result<T> = std::result::Result<T, DownloadError>;
