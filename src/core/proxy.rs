//! Proxy request pipeline.
//!
//! `service` drives the per-request state machine, `upstream` owns the
//! pooled client and redirect policy, `headers` keeps both directions
//! hygienic, `copy` streams bodies through pooled buffers, and
//! `response` assembles everything the proxy writes itself.

pub mod copy;
pub mod headers;
pub mod response;
pub mod service;
pub mod upstream;

pub use service::CamoProxy;
pub use upstream::{RedirectPolicy, UpstreamClient};
