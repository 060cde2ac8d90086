//! Error types for the companion-core library.
//!
//! Routine "not found" outcomes of probing and scanning are not errors:
//! they are expressed as `bool`/`Option` returns or as a service state.
//! Only configuration and launch failures surface here.

use thiserror::Error;

/// Result type alias for companion operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or launching companion services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing home directory, unknown service, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A child process failed to start.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// HTTP client construction failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
