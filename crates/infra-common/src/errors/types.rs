//! Error and result types shared by the infrastructure layer.

use thiserror::Error;

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by infrastructure components
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// A component failed to initialize
    #[error("initialization error: {0}")]
    Init(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(details: impl Into<String>) -> Self {
        Self::Config(details.into())
    }

    /// Create a new initialization error
    pub fn init(details: impl Into<String>) -> Self {
        Self::Init(details.into())
    }
}
