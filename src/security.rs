//! Request authorization and SSRF defense.
//!
//! `sign` verifies the HMAC-signed URL, `filter` holds the CIDR
//! denylist, and `validate` composes resolution with both checks.

pub mod filter;
pub mod sign;
pub mod validate;
