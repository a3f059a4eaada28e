//! Configuration settings.
//!
//! Defines the main `Config` struct and environment variable loading
//! logic. Explicit CLI flags override the environment in `main`.

use crate::security::filter::FILTERED_NETWORKS;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Maximum size proxied by default, in bytes.
pub const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of redirects followed by default.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default total timeout for the upstream exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Name set on the `Via` header and matched for loop detection.
pub const DEFAULT_SERVER_NAME: &str = "bepress/camo";

/// Environment variable holding the shared signing secret.
pub const HMAC_ENV_KEY: &str = "CAMO_HMAC_SECRET";

fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_bool_or(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

fn get_env_u64_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn get_env_usize_or(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frontend address clients connect to.
    pub listen_addr: SocketAddr,
    /// Loopback address serving the metrics snapshot.
    pub metrics_addr: SocketAddr,
    /// Shared HMAC signing secret, wiped on drop. Must be non-empty
    /// to serve.
    pub hmac_secret: Zeroizing<String>,
    /// Name set on `Via` and matched for loop detection.
    pub server_name: String,
    /// Largest upstream body the proxy will relay, in bytes.
    pub max_size: u64,
    /// Redirect hop budget for the upstream client.
    pub max_redirects: usize,
    /// Total per-request timeout for the upstream exchange.
    pub request_timeout: Duration,
    /// Periodic flush cadence for the body copy; zero disables it.
    pub flush_interval: Duration,
    /// Send `Connection: close` on every response.
    pub disable_keepalives_fe: bool,
    /// Disable connection reuse toward upstreams.
    pub disable_keepalives_be: bool,
    /// Require resolved addresses to be global unicast.
    pub check_unicast: bool,
    /// CIDR denylist literals.
    pub filtered_networks: Vec<String>,
    /// Value for `Content-Security-Policy: default-src <origin>`.
    pub csp_origin: String,
    /// Extra response headers, applied to every reply.
    pub add_response_headers: Vec<(String, String)>,
    /// TLS certificate path; with `tls_key`, enables TLS termination.
    pub tls_cert: Option<String>,
    /// TLS private key path.
    pub tls_key: Option<String>,
    /// Logging format: "json" or "pretty".
    pub log_format: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Panics
    ///
    /// Panics if `CAMO_LISTEN_ADDR` or `CAMO_METRICS_ADDR` is not a
    /// valid socket address.
    #[must_use]
    pub fn from_env() -> Arc<Self> {
        let listen_addr = get_env_or("CAMO_LISTEN_ADDR", "0.0.0.0:8080")
            .parse()
            .expect("CAMO_LISTEN_ADDR must be a valid socket address");
        let metrics_addr = get_env_or("CAMO_METRICS_ADDR", "127.0.0.1:9000")
            .parse()
            .expect("CAMO_METRICS_ADDR must be a valid socket address");

        let filtered_networks = match env::var("CAMO_FILTERED_NETWORKS") {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => FILTERED_NETWORKS.iter().map(|s| (*s).to_string()).collect(),
        };

        let add_response_headers = get_env_or("CAMO_ADD_RESPONSE_HEADERS", "")
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect();

        Arc::new(Self {
            listen_addr,
            metrics_addr,
            hmac_secret: Zeroizing::new(get_env_or(HMAC_ENV_KEY, "")),
            server_name: get_env_or("CAMO_SERVER_NAME", DEFAULT_SERVER_NAME),
            max_size: get_env_u64_or("CAMO_MAX_SIZE_MB", DEFAULT_MAX_SIZE / (1024 * 1024))
                * 1024
                * 1024,
            max_redirects: get_env_usize_or("CAMO_MAX_REDIRECTS", DEFAULT_MAX_REDIRECTS),
            request_timeout: Duration::from_secs(get_env_u64_or(
                "CAMO_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT.as_secs(),
            )),
            flush_interval: Duration::from_millis(get_env_u64_or("CAMO_FLUSH_INTERVAL_MS", 0)),
            disable_keepalives_fe: get_env_bool_or("CAMO_DISABLE_KEEPALIVES_FE", false),
            disable_keepalives_be: get_env_bool_or("CAMO_DISABLE_KEEPALIVES_BE", false),
            check_unicast: get_env_bool_or("CAMO_CHECK_UNICAST", true),
            filtered_networks,
            csp_origin: get_env_or("CAMO_CSP_ORIGIN", "'none'"),
            add_response_headers,
            tls_cert: env::var("CAMO_TLS_CERT").ok().filter(|s| !s.is_empty()),
            tls_key: env::var("CAMO_TLS_KEY").ok().filter(|s| !s.is_empty()),
            log_format: get_env_or("LOG_FORMAT", "json"),
        })
    }

    /// Whether the frontend terminates TLS; drives the
    /// `X-Forwarded-Proto` value sent upstream.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
