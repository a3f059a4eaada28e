//! Test utilities and shared configuration.
//!
//! This module provides common helpers for unit and integration tests,
//! reducing duplication across the codebase.

#[cfg(any(test, feature = "testing"))]
use crate::config::{Config, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_SIZE, DEFAULT_SERVER_NAME};
#[cfg(any(test, feature = "testing"))]
use crate::security::filter::FILTERED_NETWORKS;
#[cfg(any(test, feature = "testing"))]
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
#[cfg(any(test, feature = "testing"))]
use hmac::{Hmac, Mac};
#[cfg(any(test, feature = "testing"))]
use std::sync::Arc;
#[cfg(any(test, feature = "testing"))]
use std::time::Duration;
#[cfg(any(test, feature = "testing"))]
use zeroize::Zeroizing;

/// Creates a standard configuration for testing purposes.
///
/// Listeners bind to OS-assigned loopback ports, the signing key is
/// `"test"`, and the default deny list is installed.
#[cfg(any(test, feature = "testing"))]
#[must_use]
pub fn create_test_config() -> Arc<Config> {
    Arc::new(Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        hmac_secret: Zeroizing::new("test".to_string()),
        server_name: DEFAULT_SERVER_NAME.to_string(),
        max_size: DEFAULT_MAX_SIZE,
        max_redirects: DEFAULT_MAX_REDIRECTS,
        request_timeout: Duration::from_secs(4),
        flush_interval: Duration::ZERO,
        disable_keepalives_fe: false,
        disable_keepalives_be: false,
        check_unicast: true,
        filtered_networks: FILTERED_NETWORKS.iter().map(|s| (*s).to_string()).collect(),
        csp_origin: "'none'".to_string(),
        add_response_headers: Vec::new(),
        tls_cert: None,
        tls_key: None,
        log_format: "pretty".to_string(),
    })
}

/// Builds a signed camo path for `url` under `key`:
/// `/<digest-b64url>/<url-b64url>`.
#[cfg(any(test, feature = "testing"))]
#[must_use]
pub fn signed_path(key: &[u8], url: &str) -> String {
    let mut mac =
        <Hmac<sha1::Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(url.as_bytes());
    format!(
        "/{}/{}",
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        URL_SAFE_NO_PAD.encode(url.as_bytes())
    )
}
