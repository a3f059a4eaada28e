//! Library definitions.
//!
//! Exports the configuration, security, and proxy modules plus the
//! main service implementation.

pub mod config;
pub mod core;
pub mod security;
pub mod web;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use config::{CamoError, Config, Result};
pub use core::proxy::{CamoProxy, RedirectPolicy, UpstreamClient};
pub use security::filter::{CidrFilter, FILTERED_NETWORKS};
pub use security::sign::{SignError, UrlVerifier, Verify};
pub use security::validate::{Resolve, SystemResolver, TargetValidator, ValidateError};
pub use web::metrics::{Metrics, run_gauge_ticker, run_metrics_listener};
