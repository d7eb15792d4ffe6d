//! Error types for the Nexis console

use thiserror::Error;

/// Result type alias using the console Error
pub type Result<T> = std::result::Result<T, Error>;

/// Console error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    /// Upstream answered with a non-2xx status.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// The named upstream service has no base URL configured.
    #[error("{0} service is not configured")]
    NotConfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
        }
    }

    /// HTTP status this error should surface as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound { .. } => 404,
            Error::NotConfigured(_) => 501,
            Error::Upstream { status, .. } => *status,
            Error::Http(_) => 502,
            _ => 500,
        }
    }
}

impl From<aes_gcm::Error> for Error {
    fn from(_: aes_gcm::Error) -> Self {
        Error::Crypto("authenticated decryption failed".to_string())
    }
}
