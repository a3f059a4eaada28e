//! Configuration management.
//!
//! Loads configuration from environment variables using dotenvy.
//! All settings are loaded at startup and stored in a thread-safe Arc.

mod error;
mod settings;

pub use error::{CamoError, Result};
pub use settings::{
    Config, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_SIZE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SERVER_NAME, HMAC_ENV_KEY,
};
