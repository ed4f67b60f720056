//! HTTP upgrade request head.
//!
//! Only the request line and headers are read off the socket. Whatever bytes
//! arrive after the blank line belong to the WebSocket stream and are handed
//! back to the caller untouched.

use crate::error::{HybiError, HybiResult};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};

/// Upper bound on the request head size.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// The parsed upgrade request, captured once per connection.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub method: String,
    /// Raw request target (path and query).
    pub target: String,
    /// Path component without the query string.
    pub pathname: String,
    /// Decoded query parameters.
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl UpgradeRequest {
    /// Build a request from a method, target and header pairs. Values are
    /// kept byte for byte, so obs-text survives.
    pub fn new<I, K, V>(method: &str, target: &str, headers: I) -> HybiResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_ref().as_bytes())
                .map_err(|e| HybiError::InvalidRequest(format!("bad header name: {e}")))?;
            let value = HeaderValue::from_bytes(value.as_ref())
                .map_err(|e| HybiError::InvalidRequest(format!("bad header value: {e}")))?;
            map.append(name, value);
        }
        let (pathname, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            pathname: pathname.to_string(),
            params,
            headers: map,
        })
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Comma-separated service names requested by the client: the
    /// `bind_services` query parameter, or else the path without its leading
    /// slash.
    pub fn bind_services(&self) -> String {
        match self.params.get("bind_services") {
            Some(list) => list.clone(),
            None => self.pathname.trim_start_matches('/').to_string(),
        }
    }
}

/// Read and parse the request head from `stream`.
///
/// Returns the request plus any bytes read past the end of the head.
pub async fn read_upgrade_request<R>(stream: &mut R) -> HybiResult<(UpgradeRequest, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HybiError::InvalidRequest(
                "connection closed before request head completed".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(parsed) = try_parse(&buf)? {
            let (request, head_len) = parsed;
            let rest = buf.split_off(head_len);
            return Ok((request, rest));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(HybiError::InvalidRequest(format!(
                "request head exceeds {MAX_REQUEST_HEAD} bytes"
            )));
        }
    }
}

fn try_parse(buf: &[u8]) -> HybiResult<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HybiError::InvalidRequest(e.to_string())),
    };

    let method = req.method.unwrap_or("GET");
    let target = req.path.unwrap_or("/");
    let pairs = req
        .headers
        .iter()
        .map(|h| (h.name, h.value));
    let request = UpgradeRequest::new(method, target, pairs)?;
    Ok(Some((request, head_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_head_and_keeps_trailing_bytes() {
        let raw = b"GET /chat,news?bind_services=chat&x=1 HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n\x81\x00";
        let mut input = &raw[..];
        let (req, rest) = read_upgrade_request(&mut input).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.pathname, "/chat,news");
        assert_eq!(req.params.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(req.header("HOST"), Some("example.com"));
        assert_eq!(req.bind_services(), "chat");
        assert_eq!(rest, vec![0x81, 0x00]);
    }

    #[tokio::test]
    async fn head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client
                .write_all(b"GET /echo HTTP/1.1\r\nUpgrade: websocket\r\n\r\n")
                .await
                .unwrap();
            client
        });
        let (req, rest) = read_upgrade_request(&mut server).await.unwrap();
        assert_eq!(req.bind_services(), "echo");
        assert!(rest.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn obs_text_header_bytes_are_kept() {
        let raw = b"GET /echo HTTP/1.1\r\nHost: example.com\r\nX-Name: caf\xe9\r\n\r\n";
        let mut input = &raw[..];
        let (request, rest) = read_upgrade_request(&mut input).await.unwrap();
        assert!(rest.is_empty());
        let value = request.headers.get("x-name").unwrap();
        assert_eq!(value.as_bytes(), b"caf\xe9");
        assert_eq!(request.header("x-name"), None);
        assert_eq!(request.header("host"), Some("example.com"));
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut input = &b"GET / HTTP/1.1\r\nHost: x\r\n"[..];
        let err = read_upgrade_request(&mut input).await.unwrap_err();
        assert!(matches!(err, HybiError::InvalidRequest(_)));
    }

    #[test]
    fn path_is_the_fallback_bind_list() {
        let req = UpgradeRequest::new("GET", "/a,b", Vec::<(&str, &str)>::new()).unwrap();
        assert_eq!(req.bind_services(), "a,b");
    }
}
