//! Upgrade handshake validation.
//!
//! Checks the upgrade headers and origin, then derives the accept key:
//! `base64(SHA-1(key || "258EAFA5-E914-47DA-95CA-C5AB0DC85B11"))`.
//! A rejected handshake never produces a response; the caller tears the
//! transport down.

use crate::error::{HybiError, HybiResult};
use crate::origin::OriginAllowList;
use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::warn;

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Name of the response header carrying the conversation token.
pub const SESSION_TOKEN_HEADER: &str = "Session-Token";

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Validate the upgrade headers against the origin allow-list.
///
/// Returns the accept key on success.
pub fn validate(headers: &HeaderMap, origins: &OriginAllowList) -> HybiResult<String> {
    match header(headers, "upgrade") {
        Some(upgrade) if upgrade.eq_ignore_ascii_case("websocket") => {}
        _ => {
            warn!("connection invalid");
            return Err(HybiError::Handshake("missing or invalid upgrade header".into()));
        }
    }

    let origin = header(headers, "sec-websocket-origin").unwrap_or("");
    if !origins.verify(origin) {
        warn!("connection invalid: origin mismatch");
        return Err(HybiError::IllegalOrigin(origin.to_string()));
    }

    let key = match header(headers, "sec-websocket-key") {
        Some(key) if !key.trim().is_empty() => key.trim(),
        _ => {
            warn!("connection invalid: received no key");
            return Err(HybiError::Handshake("received no key".into()));
        }
    };

    Ok(accept_key(key))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Render the `101 Switching Protocols` response.
pub fn build_response(token: &str, accept: &str) -> String {
    [
        "HTTP/1.1 101 Switching Protocols".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("{SESSION_TOKEN_HEADER}: {token}"),
        format!("Sec-WebSocket-Accept: {accept}"),
        String::new(),
        String::new(),
    ]
    .join("\r\n")
}
