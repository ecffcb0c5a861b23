//! Trust error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Invalid certificate pin: {0}")]
    InvalidPin(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
