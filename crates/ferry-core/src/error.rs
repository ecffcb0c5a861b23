//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] ferry_storage::StorageError),

    #[error("Session error: {0}")]
    Session(#[from] ferry_session::SessionError),

    #[error("Download error: {0}")]
    Download(#[from] ferry_download::DownloadError),

    #[error("Trust error: {0}")]
    Trust(#[from] ferry_trust::TrustError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
