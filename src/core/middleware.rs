//! Request middleware helpers.
//!
//! Request identifiers ride the `X-Request-ID` header: an inbound id
//! is honored, otherwise a 20-character opaque id is minted. The id is
//! echoed on every response and stamped on the access record.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use pingora::http::RequestHeader;
use rand::Rng;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Reads the inbound request id or mints a fresh one.
#[must_use]
pub fn request_id(req: &RequestHeader) -> String {
    req.headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(mint_request_id, ToString::to_string)
}

/// 15 random bytes, base64url: a 20-character opaque identifier.
#[must_use]
pub fn mint_request_id() -> String {
    let random_bytes: [u8; 15] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}
