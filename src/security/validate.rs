//! Target host validation.
//!
//! Composes DNS resolution, the CIDR denylist, and a global-unicast
//! check into a single decision. Every resolved address must pass;
//! a hostname that resolves to both a public and an internal address
//! is rejected outright. The handler runs this once for the signed
//! target and the upstream client re-runs it for every redirect hop.

use crate::security::filter::CidrFilter;
use async_trait::async_trait;
use reqwest::Url;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Validation failures. Display text is wire-visible behind the
/// handler's `invalid host: ` prefix.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("{0}")]
    Resolve(String),

    #[error("filtered host address: \"{0}\"")]
    Filtered(IpAddr),

    #[error("resolved to reserved address: \"{0}\"")]
    Reserved(IpAddr),
}

/// DNS seam so tests can pin resolution.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Production resolver over the tokio host lookup.
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Stub resolver returning a fixed address set.
#[cfg(any(test, feature = "testing"))]
pub struct StaticResolver(pub Vec<IpAddr>);

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

pub struct TargetValidator {
    filter: CidrFilter,
    resolver: Arc<dyn Resolve>,
    check_unicast: bool,
}

impl TargetValidator {
    pub fn new(filter: CidrFilter, resolver: Arc<dyn Resolve>, check_unicast: bool) -> Self {
        Self {
            filter,
            resolver,
            check_unicast,
        }
    }

    /// Checks every address the target host resolves to against the
    /// denylist and, when enabled, the global-unicast requirement.
    pub async fn validate(&self, target: &Url) -> Result<(), ValidateError> {
        let host = target
            .host_str()
            .ok_or_else(|| ValidateError::Resolve("missing host in target URL".to_string()))?;
        // Bracketed IPv6 literals keep their brackets in host_str.
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let ips = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| ValidateError::Resolve(e.to_string()))?;

        for ip in ips {
            if !self.filter.allowed(&ip) {
                return Err(ValidateError::Filtered(ip));
            }
            if self.check_unicast && !is_global_unicast(&ip) {
                return Err(ValidateError::Reserved(ip));
            }
        }

        Ok(())
    }
}

/// A routable unicast address: not unspecified, loopback, multicast,
/// link-local, or (v4) broadcast.
fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            // fe80::/10 link-local unicast
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local)
        }
    }
}
