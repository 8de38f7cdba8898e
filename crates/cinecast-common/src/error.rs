//! Common error types for Cinecast.

use thiserror::Error;

/// Result type alias using Cinecast's shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by shared infrastructure (configuration, environment).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Environment variable present but unreadable
    #[error("environment error: {0}")]
    Env(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an environment error from any displayable type.
    pub fn env(msg: impl std::fmt::Display) -> Self {
        Self::Env(msg.to_string())
    }
}
