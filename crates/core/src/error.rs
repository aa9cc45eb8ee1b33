//! Core error types

use thiserror::Error;

/// Core error type for fleetloop
#[derive(Debug, Error)]
pub enum Error {
    /// Generic error
    #[error("Core error: {0}")]
    Generic(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
