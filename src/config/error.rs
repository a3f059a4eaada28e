//! Error types and result aliases.
//!
//! Startup-time failures. Request-time errors live with their
//! subsystems (`SignError`, `ValidateError`, `FetchError`, `CopyError`)
//! and never cross the handler boundary.

use crate::security::filter::FilterError;
use thiserror::Error;

/// Fatal construction errors. Any of these refuses to serve.
#[derive(Debug, Error)]
pub enum CamoError {
    /// Configuration error, including an empty signing key.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed CIDR in the deny list.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// The upstream HTTP client could not be built.
    #[error("http client error: {0}")]
    Client(String),
}

/// Result type alias for `CamoError`.
pub type Result<T> = std::result::Result<T, CamoError>;
