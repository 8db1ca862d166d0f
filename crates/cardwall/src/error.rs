//! Error types for the cardwall engine

use cardwall_core::LoginError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CardwallError>;

/// Errors that can occur outside a single authentication step
#[derive(Debug, Error)]
pub enum CardwallError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] cardwall_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The login attempt failed
    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    /// The request was superseded by a newer one for the same profile
    #[error("Operation cancelled")]
    Cancelled,
}

impl CardwallError {
    /// The login failure to classify, if this is one
    pub fn login_error(&self) -> Option<&LoginError> {
        match self {
            CardwallError::Login(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CardwallError {
    fn from(e: serde_json::Error) -> Self {
        CardwallError::Serialization(e.to_string())
    }
}
