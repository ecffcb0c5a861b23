//! Ferry Session - background transfer sessions
//!
//! A session owns an HTTP client and a serial event queue. Download tasks
//! stream to files under the session's cache directory and report to a
//! [`SessionDelegate`] one event at a time.

mod configuration;
mod delegate;
mod error;
mod identifier;
mod manager;
mod protection;
mod request;
mod resume;
mod session;
mod task;
mod tls;
mod transfer;

pub use configuration::{
    SessionConfiguration, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDENTIFIER_PREFIX, DEFAULT_TIMEOUT,
};
pub use delegate::SessionDelegate;
pub use error::{RequestError, SessionError, TransferError};
pub use identifier::SessionIdentifier;
pub use manager::SessionManager;
pub use protection::{DirectoryProtection, OwnerOnlyProtection};
pub use request::{CachePolicy, DownloadRequest};
pub use resume::ResumeData;
pub use session::TransportSession;
pub use task::{DownloadTask, TaskId, TaskState};

pub type Result<T> = std::result::Result<T, SessionError>;
