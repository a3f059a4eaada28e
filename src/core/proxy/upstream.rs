//! Upstream HTTP client with validator-gated redirect following.
//!
//! Automatic redirects are disabled on the underlying client; the
//! fetch loop follows them itself so that every hop re-enters the
//! target validator before a connection is attempted. A chain longer
//! than the configured budget aborts with a client error, which the
//! handler maps to 500.

use crate::config::Config;
use crate::core::proxy::headers::build_upstream_headers;
use crate::security::validate::{TargetValidator, ValidateError};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, Response, Url};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNS_PER_HOST: usize = 8;

/// Statuses the fetch loop will follow when the policy allows it.
const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

/// How the fetch loop treats upstream redirects. Tests use
/// `UseLastResponse` to stop at the first response without following.
#[derive(Debug, Clone, Copy)]
pub enum RedirectPolicy {
    Follow { max_redirects: usize },
    UseLastResponse,
}

/// Fetch failures. Display text becomes part of the handler's
/// `error processing request: "..."` reply.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error("stopped after {0} redirects")]
    RedirectLimit(usize),

    #[error("{0}")]
    RedirectTarget(#[from] ValidateError),

    #[error("invalid redirect location: {0}")]
    Location(String),
}

/// Pooled client shared by every request for the process lifetime.
pub struct UpstreamClient {
    client: reqwest::Client,
    policy: RedirectPolicy,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self, crate::config::CamoError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .read_timeout(RESPONSE_HEADER_TIMEOUT)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
            .tcp_keepalive(IDLE_CONN_TIMEOUT)
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none());

        if config.disable_keepalives_be {
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .build()
            .map_err(|e| crate::config::CamoError::Client(e.to_string()))?;

        Ok(Self {
            client,
            policy: RedirectPolicy::Follow {
                max_redirects: config.max_redirects,
            },
        })
    }

    pub fn set_policy(&mut self, policy: RedirectPolicy) {
        self.policy = policy;
    }

    /// Executes the upstream exchange. The initial target is assumed
    /// already validated by the handler; every redirect target is
    /// validated here before it is followed.
    ///
    /// A 3xx that cannot be followed (no `Location`, or the
    /// `UseLastResponse` policy) is returned as-is for the handler's
    /// status mapping.
    pub async fn fetch(
        &self,
        method: Method,
        target: Url,
        inbound_headers: &[(String, Vec<u8>)],
        client_ip: Option<IpAddr>,
        tls_frontend: bool,
        validator: &TargetValidator,
    ) -> Result<Response, FetchError> {
        let headers: HeaderMap = build_upstream_headers(inbound_headers, client_ip, tls_frontend);

        let mut url = target;
        let mut hops = 0usize;
        loop {
            if hops > 0 {
                validator.validate(&url).await?;
            }

            let resp = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .send()
                .await?;

            let status = resp.status().as_u16();
            let max_redirects = match self.policy {
                RedirectPolicy::UseLastResponse => return Ok(resp),
                RedirectPolicy::Follow { max_redirects } => max_redirects,
            };

            if !REDIRECT_STATUSES.contains(&status) {
                return Ok(resp);
            }

            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let Some(location) = location else {
                return Ok(resp);
            };
            let next = url
                .join(&location)
                .map_err(|e| FetchError::Location(e.to_string()))?;

            hops += 1;
            if hops > max_redirects {
                return Err(FetchError::RedirectLimit(max_redirects));
            }
            debug!(hop = hops, location = %next, "following upstream redirect");
            url = next;
        }
    }
}
