//! Error handling for the media selection engine.
//!
//! Runtime conditions (pool exhaustion, duplicate adds, unknown removes)
//! are reported through boolean returns on the engine itself and never
//! escape as errors; this module covers the fallible construction path.

use thiserror::Error;

/// Result type alias for media-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the media selection engine
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid engine configuration
    #[error("invalid engine configuration: {details}")]
    InvalidConfig { details: String },
}

impl Error {
    /// Create a new invalid configuration error
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig { details: details.into() }
    }
}
