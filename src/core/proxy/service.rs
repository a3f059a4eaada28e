//! Proxy service logic.
//!
//! Implements the per-request state machine: method and loop gates,
//! signed-path split, signature verification, target validation,
//! upstream fetch, status mapping, and the streamed body copy. Every
//! request reaches a terminal outcome inside `request_filter`; the
//! upstream exchange goes through the proxy's own pooled client so
//! that redirect hops can re-enter the validator.

use crate::config::Config;
use crate::core::middleware::request_id;
use crate::core::proxy::copy::{self, BufferPool, create_buffer_pool};
use crate::core::proxy::headers::forwardable_response_headers;
use crate::core::proxy::response::{
    apply_base_headers, favicon_bytes, serve_error, serve_favicon, serve_health,
};
use crate::core::proxy::upstream::{RedirectPolicy, UpstreamClient};
use crate::security::filter::CidrFilter;
use crate::security::sign::{UrlVerifier, Verify};
use crate::security::validate::{SystemResolver, TargetValidator};
use crate::web::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use pingora::Result;
use pingora::http::ResponseHeader;
use pingora::proxy::{ProxyHttp, Session};
use pingora::upstreams::peer::HttpPeer;
use reqwest::{Method, Url};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Context for a single request.
pub struct RequestCtx {
    pub request_id: String,
    pub start: Instant,
    pub response_bytes: u64,
}

/// Statuses the handler is willing to stream; everything else maps to
/// an error reply.
#[derive(Debug, PartialEq, Eq)]
enum UpstreamDisposition {
    Stream,
    RedirectExhausted,
    ServerError,
    Unsuitable,
}

fn classify_status(status: u16) -> UpstreamDisposition {
    match status {
        200 | 206 | 304 | 410 => UpstreamDisposition::Stream,
        301 | 302 | 303 | 307 => UpstreamDisposition::RedirectExhausted,
        500 | 502 | 503 | 504 => UpstreamDisposition::ServerError,
        _ => UpstreamDisposition::Unsuitable,
    }
}

/// Splits the request path into its signed components, verifying the
/// shape: leading empty segment, digest, encoded URL.
fn split_path(path: &str) -> std::result::Result<(&str, &str), String> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 3 {
        return Err(format!(
            "invalid camo url path: {path}, wanted 3 parts got {}",
            parts.len()
        ));
    }
    Ok((parts[1], parts[2]))
}

fn status_text(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_u16()),
        None => status.as_u16().to_string(),
    }
}

fn client_ip(session: &Session) -> Option<IpAddr> {
    session.client_addr().and_then(|addr| {
        if let pingora::protocols::l4::socket::SocketAddr::Inet(inet) = addr {
            Some(inet.ip())
        } else {
            None
        }
    })
}

/// Main proxy service implementing `ProxyHttp`.
pub struct CamoProxy {
    config: Arc<Config>,
    verifier: Arc<dyn Verify>,
    validator: Arc<TargetValidator>,
    upstream: UpstreamClient,
    buffers: BufferPool,
    metrics: Arc<Metrics>,
    favicon: Bytes,
    flush_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl CamoProxy {
    /// Builds the service from configuration. Fails on an empty
    /// signing key, a malformed CIDR in the filter list, or an
    /// unbuildable upstream client.
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> crate::config::Result<Self> {
        let verifier = UrlVerifier::new(config.hmac_secret.as_bytes().to_vec())?;
        let filter = CidrFilter::new(&config.filtered_networks)?;
        let validator = Arc::new(TargetValidator::new(
            filter,
            Arc::new(SystemResolver),
            config.check_unicast,
        ));
        let upstream = UpstreamClient::new(&config)?;

        Ok(Self {
            config,
            verifier: Arc::new(verifier),
            validator,
            upstream,
            buffers: create_buffer_pool(),
            metrics,
            favicon: favicon_bytes(),
            flush_hook: None,
        })
    }

    /// Substitutes the signature verifier (tests).
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verify>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Substitutes the target validator (tests pin the resolver or
    /// open the filter).
    #[must_use]
    pub fn with_validator(mut self, validator: TargetValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    #[must_use]
    pub fn with_redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.upstream.set_policy(policy);
        self
    }

    /// Installs the flush-loop exit callback (tests).
    #[must_use]
    pub fn with_flush_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.flush_hook = Some(hook);
        self
    }

    async fn reject(
        &self,
        session: &mut Session,
        ctx: &mut RequestCtx,
        status: u16,
        message: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<bool> {
        serve_error(session, &self.config, ctx, status, message, extra_headers).await
    }

    /// Writes the upstream response headers and streams the body.
    async fn stream_upstream(
        &self,
        session: &mut Session,
        ctx: &mut RequestCtx,
        head_request: bool,
        resp: reqwest::Response,
    ) -> Result<bool> {
        let status = resp.status().as_u16();
        let mut header = ResponseHeader::build(status, None)?;
        for (name, value) in forwardable_response_headers(resp.headers()) {
            header.append_header(name, value)?;
        }
        // Applied last so the proxy's own values win over anything the
        // upstream sent for the same names.
        apply_base_headers(&mut header, &self.config, &ctx.request_id)?;

        session
            .write_response_header(Box::new(header), head_request)
            .await?;

        if head_request {
            return Ok(true);
        }

        match copy::copy_body(
            session,
            resp.bytes_stream(),
            &self.buffers,
            self.config.max_size,
            self.config.flush_interval,
            self.flush_hook.as_deref(),
        )
        .await
        {
            Ok(written) => {
                ctx.response_bytes = written;
                session.write_response_body(None, true).await?;
                Ok(true)
            }
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "body copy aborted");
                // Headers are already on the wire; closing the
                // connection is the only honest signal left.
                Err(pingora::Error::new(pingora::ErrorType::Custom(
                    "upstream body copy failed",
                )))
            }
        }
    }
}

#[async_trait]
impl ProxyHttp for CamoProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            request_id: String::new(),
            start: Instant::now(),
            response_bytes: 0,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        self.metrics.incr(crate::web::metrics::REQUESTS);
        ctx.request_id = request_id(session.req_header());

        let method = session.req_header().method.as_str().to_string();
        if method != "GET" && method != "HEAD" {
            return self
                .reject(
                    session,
                    ctx,
                    405,
                    &format!("Method not allowed: {method}"),
                    &[("Allowed", "GET,HEAD")],
                )
                .await;
        }

        let via = session
            .req_header()
            .headers
            .get("Via")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if via == self.config.server_name {
            return self.reject(session, ctx, 404, "Redirect loop detected", &[]).await;
        }

        let path = session.req_header().uri.path().to_string();
        let (digest, encoded_url) = match split_path(&path) {
            Ok(parts) => parts,
            Err(e) => {
                // Not a signed URL; the sidepaths get a chance before
                // the shape error is returned.
                if path == "/health" {
                    return serve_health(session, &self.config, ctx).await;
                }
                if path == "/favicon.ico" {
                    return serve_favicon(session, &self.config, ctx, &self.favicon).await;
                }
                error!(request_id = %ctx.request_id, error = %e, "bad request path");
                return self.reject(session, ctx, 400, &e, &[]).await;
            }
        };

        let url_bytes = match self.verifier.verify(digest, encoded_url) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "signature verification failed");
                return self.reject(session, ctx, 403, &e.to_string(), &[]).await;
            }
        };

        let target = match String::from_utf8(url_bytes)
            .map_err(|e| e.to_string())
            .and_then(|s| Url::parse(&s).map_err(|e| e.to_string()))
        {
            Ok(url) => url,
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "bad downstream url");
                return self
                    .reject(session, ctx, 403, &format!("Invalid downstream URL: {e}"), &[])
                    .await;
            }
        };

        if let Err(e) = self.validator.validate(&target).await {
            error!(request_id = %ctx.request_id, error = %e, "target validation failed");
            return self
                .reject(session, ctx, 400, &format!("invalid host: {e}"), &[])
                .await;
        }

        let inbound_headers: Vec<(String, Vec<u8>)> = session
            .req_header()
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        let out_method = if method == "HEAD" {
            Method::HEAD
        } else {
            Method::GET
        };

        let resp = match self
            .upstream
            .fetch(
                out_method,
                target.clone(),
                &inbound_headers,
                client_ip(session),
                self.config.tls_enabled(),
                &self.validator,
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "upstream request failed");
                return self
                    .reject(
                        session,
                        ctx,
                        500,
                        &format!("error processing request: {:?}", e.to_string()),
                        &[],
                    )
                    .await;
            }
        };

        info!(
            request_id = %ctx.request_id,
            upstream_domain = target.host_str().unwrap_or(""),
            upstream_response = resp.status().as_u16(),
            upstream_path = target.path(),
            content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
            content_length = resp.content_length().unwrap_or(0),
            "upstream exchange"
        );

        if let Some(length) = resp.content_length() {
            if length > self.config.max_size {
                return self.reject(session, ctx, 413, "Payload too large", &[]).await;
            }
        }

        match classify_status(resp.status().as_u16()) {
            UpstreamDisposition::Stream => {
                self.stream_upstream(session, ctx, method == "HEAD", resp).await
            }
            UpstreamDisposition::RedirectExhausted => {
                self.reject(session, ctx, 404, "Too many redirects", &[]).await
            }
            UpstreamDisposition::ServerError => {
                self.reject(
                    session,
                    ctx,
                    502,
                    &format!("Error Fetching Resource: {}", status_text(resp.status())),
                    &[],
                )
                .await
            }
            UpstreamDisposition::Unsuitable => {
                self.reject(session, ctx, 404, "Unable to find suitable content", &[])
                    .await
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        // Every request is terminated in request_filter; pingora's own
        // upstream path is never taken.
        Err(pingora::Error::new(pingora::ErrorType::Custom(
            "camo performs the upstream exchange in request_filter",
        )))
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status = session.response_written().map_or(0, |r| r.status.as_u16());
        let duration = ctx.start.elapsed();
        self.metrics.observe(status, ctx.response_bytes, duration);

        let client = client_ip(session).map_or_else(String::new, |ip| ip.to_string());
        let error = e.map(|err| err.to_string()).unwrap_or_default();
        let req = session.req_header();
        let header_str = |name: &str| {
            req.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        info!(
            category = "access",
            request_id = %ctx.request_id,
            client_ip = %client,
            x_forwarded_for = %header_str("X-Forwarded-For"),
            duration_ms = duration.as_millis() as u64,
            domain = %header_str("Host"),
            method = %req.method.as_str(),
            uri = %req.uri,
            protocol = ?req.version,
            status,
            response_bytes = ctx.response_bytes,
            referrer = %header_str("Referer"),
            user_agent = %header_str("User-Agent"),
            error = %error,
            ""
        );
    }
}
