//! Header hygiene for both directions of the proxy.
//!
//! Hop-by-hop headers (RFC 7230 §6.1) are meaningful for a single
//! transport connection only and are removed symmetrically from the
//! upstream request and the upstream response, together with anything
//! named by a `Connection` header.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;

/// Headers never forwarded end-to-end.
pub const HOP_HEADERS: [&str; 9] = [
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

pub fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Lowercased tokens named by `Connection` header values.
pub fn connection_options<'a, I>(values: I) -> Vec<String>
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut options = Vec::new();
    for value in values {
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                options.push(token.to_ascii_lowercase());
            }
        }
    }
    options
}

/// Builds the header set for the upstream request from the inbound
/// headers: hop-by-hop and `Connection`-named headers are dropped,
/// `Host`/`Content-Length` are left for the client to recompute, the
/// client address is folded onto `X-Forwarded-For`, and
/// `X-Forwarded-Proto` reflects whether the frontend terminated TLS.
pub fn build_upstream_headers(
    inbound: &[(String, Vec<u8>)],
    client_ip: Option<IpAddr>,
    tls_frontend: bool,
) -> HeaderMap {
    let dropped = connection_options(
        inbound
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("Connection"))
            .map(|(_, value)| value.as_slice()),
    );

    let mut headers = HeaderMap::new();
    let mut forwarded_for: Vec<String> = Vec::new();

    for (name, value) in inbound {
        if is_hop_header(name)
            || dropped.iter().any(|d| d.eq_ignore_ascii_case(name))
            || name.eq_ignore_ascii_case("Host")
            || name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("X-Forwarded-For") {
            if let Ok(prior) = std::str::from_utf8(value) {
                forwarded_for.push(prior.to_string());
            }
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    if let Some(ip) = client_ip {
        // Retain prior X-Forwarded-For entries as a comma+space
        // separated list and fold multiple headers into one.
        forwarded_for.push(ip.to_string());
    }
    if !forwarded_for.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&forwarded_for.join(", ")) {
            headers.insert("x-forwarded-for", value);
        }
    }

    let proto = if tls_frontend { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    headers
}

/// Upstream response headers that survive the hop-by-hop strip,
/// as `(name, value)` string pairs ready for the outbound response.
pub fn forwardable_response_headers(upstream: &HeaderMap) -> Vec<(String, String)> {
    let dropped = connection_options(
        upstream
            .get_all(reqwest::header::CONNECTION)
            .iter()
            .map(|v| v.as_bytes()),
    );

    let mut out = Vec::new();
    for (name, value) in upstream {
        let name = name.as_str();
        if is_hop_header(name) || dropped.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}
