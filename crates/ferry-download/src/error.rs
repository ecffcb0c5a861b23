//! Download error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Session error: {0}")]
    Session(#[from] ferry_session::SessionError),
}
