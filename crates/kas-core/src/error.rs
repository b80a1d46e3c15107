//! Error types for the kas core library.

use thiserror::Error;

/// Result type alias using the kas core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for kas operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
