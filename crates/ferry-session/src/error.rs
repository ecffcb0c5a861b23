//! Session and transfer error types

use thiserror::Error;

use crate::resume::ResumeData;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session has been invalidated")]
    Invalidated,

    #[error("No Tokio runtime available to drive the session")]
    NoRuntime,

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("TLS setup error: {0}")]
    Tls(String),
}

impl From<rustls::Error> for SessionError {
    fn from(e: rustls::Error) -> Self {
        SessionError::Tls(e.to_string())
    }
}

/// Why a URL string and header map could not become a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// Outcome of a failed task, as delivered to the session delegate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("Network error: {message}")]
    Network {
        message: String,
        resume_data: Option<ResumeData>,
    },

    #[error("Request timed out")]
    TimedOut { resume_data: Option<ResumeData> },

    #[error("Server responded with HTTP {0}")]
    Status(u16),

    #[error("Download cancelled")]
    Cancelled { resume_data: Option<ResumeData> },

    #[error("Server trust rejected for {0}")]
    TrustRejected(String),

    #[error("Authentication rejected for {0}")]
    AuthenticationRejected(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl TransferError {
    pub(crate) fn cancelled() -> Self {
        TransferError::Cancelled { resume_data: None }
    }

    /// Data to continue the transfer with, when the server allows it.
    pub fn resume_data(&self) -> Option<&ResumeData> {
        match self {
            TransferError::Network { resume_data, .. }
            | TransferError::TimedOut { resume_data }
            | TransferError::Cancelled { resume_data } => resume_data.as_ref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::TimedOut { .. })
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}
