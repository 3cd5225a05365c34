//! Opening-handshake primitives shared by the client and server endpoints
//!
//! HTTP parsing is delegated to `httparse`; this module layers the RFC 6455
//! upgrade semantics on top: header validation for both directions, request
//! and response construction, and challenge/accept key derivation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::{WS_GUID, WS_VERSION};

/// Maximum HTTP header size accepted during the handshake
const MAX_HEADER_SIZE: usize = 8192;

/// Derive the `Sec-WebSocket-Accept` value for a challenge key:
/// `base64(sha1(key ++ GUID))` (RFC 6455 section 1.3).
#[inline]
pub fn make_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh `Sec-WebSocket-Key` value: base64 of 16 bytes drawn from
/// the process-wide CSPRNG.
pub fn make_challenge_key() -> String {
    let mut bytes = [0u8; 16];
    crate::mask::random_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Split a comma-separated header value into trimmed entries.
pub fn split_header_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

// ============================================================================
// Parsed message heads
// ============================================================================

/// The request line and headers of an inbound upgrade request (server side)
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method
    pub method: String,
    /// Request path, including any query string
    pub path: String,
    /// HTTP minor version (`1` for HTTP/1.1)
    pub version: u8,
    /// All request headers in wire order
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup, returning the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Host` header, if present
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// The `Origin` header, if present
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    /// Subprotocols offered via `Sec-WebSocket-Protocol`
    pub fn subprotocols(&self) -> Vec<String> {
        self.header("sec-websocket-protocol")
            .map(split_header_list)
            .unwrap_or_default()
    }

    /// Extensions offered via `Sec-WebSocket-Extensions`
    pub fn extensions(&self) -> Vec<String> {
        self.header("sec-websocket-extensions")
            .map(split_header_list)
            .unwrap_or_default()
    }
}

/// The status line and headers of an upgrade response (client side)
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: u16,
    /// All response headers in wire order
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup, returning the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The subprotocol the server agreed to, if any
    pub fn subprotocol(&self) -> Option<&str> {
        self.header("sec-websocket-protocol")
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Try to parse a complete HTTP request from `buf`.
///
/// Returns the parsed head and the number of bytes consumed, or `None` when
/// more data is needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or("").to_string(),
                path: req.path.unwrap_or("/").to_string(),
                version: req.version.unwrap_or(0),
                headers: collect_headers(req.headers)?,
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::Handshake("malformed HTTP request".to_string())),
    }
}

/// Try to parse a complete HTTP response from `buf`.
///
/// Returns the parsed head and the number of bytes consumed, or `None` when
/// more data is needed.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                status: res.code.unwrap_or(0),
                headers: collect_headers(res.headers)?,
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::Handshake("malformed HTTP response".to_string())),
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::Handshake("invalid header value".to_string()))?;
            Ok((h.name.to_string(), value.to_string()))
        })
        .collect()
}

/// Read one HTTP request from the stream, returning the parsed head and any
/// bytes received past the end of the headers (early frame data).
pub(crate) async fn read_request<R>(stream: &mut R) -> Result<(RequestHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::Handshake("request headers too large".to_string()));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }

        if let Some((head, consumed)) = parse_request(&buf)? {
            let leftover = buf.split_off(consumed).freeze();
            return Ok((head, leftover));
        }
    }
}

/// Read one HTTP response from the stream, returning the parsed head and any
/// bytes received past the end of the headers.
pub(crate) async fn read_response<R>(stream: &mut R) -> Result<(ResponseHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::Handshake("response headers too large".to_string()));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }

        if let Some((head, consumed)) = parse_response(&buf)? {
            let leftover = buf.split_off(consumed).freeze();
            return Ok((head, leftover));
        }
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Header fields owned by the handshake; same-named user headers are dropped.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "upgrade",
    "connection",
    "sec-websocket-version",
    "sec-websocket-key",
    "sec-websocket-protocol",
];

/// Build the client's opening-handshake request (RFC 6455 section 4.1).
///
/// `host` is the `Host` header value (default port already stripped), `key`
/// the challenge key, and `protocols` the advertised subprotocols.
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[String],
    user_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: ");
    buf.put_slice(WS_VERSION.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    // Always sent, empty-valued when no subprotocols are advertised.
    buf.put_slice(b"Sec-WebSocket-Protocol: ");
    buf.put_slice(protocols.join(", ").as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in user_headers {
        if RESERVED_HEADERS.iter().any(|r| name.eq_ignore_ascii_case(r)) {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the server's 101 upgrade response.
///
/// Header lines are LF-terminated, matching the wire format this protocol
/// stack has always produced; `httparse` and browsers accept both endings.
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\n");
    buf.put_slice(b"Upgrade: websocket\n");
    buf.put_slice(b"Connection: upgrade\n");
    buf.put_slice(b"Sec-WebSocket-Version: ");
    buf.put_slice(WS_VERSION.as_bytes());
    buf.put_slice(b"\n");

    if let Some(name) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b"\n");
    }

    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\n\n");

    buf.freeze()
}

// ============================================================================
// Validation
// ============================================================================

/// Validate the server's upgrade response against the request we sent
/// (RFC 6455 section 4.1). Checks run in order; the first failure wins.
pub fn validate_response(head: &ResponseHead, sent_key: &str, advertised: &[String]) -> Result<()> {
    if head.status != 101 {
        return Err(Error::Handshake("http status not 101".to_string()));
    }

    let upgrade = head.header("upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::Handshake(
            "\"Upgrade\" header must be \"websocket\"".to_string(),
        ));
    }

    let connection = head.header("connection").unwrap_or("");
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(Error::Handshake(
            "\"Connection\" header must be \"upgrade\"".to_string(),
        ));
    }

    if head.header("sec-websocket-accept") != Some(make_accept_key(sent_key).as_str()) {
        return Err(Error::Handshake("challenge key failure".to_string()));
    }

    // A subprotocol echoed by the server must be one we offered.
    if let Some(chosen) = head.subprotocol() {
        if !advertised.iter().any(|p| p == chosen) {
            return Err(Error::Handshake(
                "server chose a subprotocol that was not offered".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validate the client's upgrade request (RFC 6455 section 4.2.1).
///
/// The websocket version and origin are checked separately by the acceptor
/// since their failures demand specific HTTP status codes (426 and 403).
pub fn validate_request(head: &RequestHead) -> Result<()> {
    if head.version < 1 {
        return Err(Error::Handshake(
            "HTTP version must be 1.1 or higher".to_string(),
        ));
    }

    if head.method != "GET" {
        return Err(Error::Handshake("HTTP method must be GET".to_string()));
    }

    let upgrade = head.header("upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::Handshake(
            "\"Upgrade\" header must be \"websocket\"".to_string(),
        ));
    }

    let connection = head.header("connection").unwrap_or("");
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(Error::Handshake(
            "\"Connection\" header must be \"upgrade\"".to_string(),
        ));
    }

    let key = head.header("sec-websocket-key").unwrap_or("");
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => Ok(()),
        _ => Err(Error::Handshake(
            "\"Sec-WebSocket-Key\" must decode to 16 bytes".to_string(),
        )),
    }
}

/// Check the `Sec-WebSocket-Version` header in isolation.
pub fn validate_version(head: &RequestHead) -> Result<()> {
    if head.header("sec-websocket-version") != Some(WS_VERSION) {
        return Err(Error::Handshake("upgrade required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn sample_request() -> RequestHead {
        parse_request(
            b"GET /chat HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\
              \r\n",
        )
        .unwrap()
        .unwrap()
        .0
    }

    #[test]
    fn accept_key_rfc_vector() {
        assert_eq!(make_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn challenge_key_decodes_to_sixteen_bytes() {
        let key = make_challenge_key();
        let decoded = BASE64.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(make_challenge_key(), key);
    }

    #[test]
    fn parse_complete_request() {
        let head = sample_request();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/chat");
        assert_eq!(head.version, 1);
        assert_eq!(head.header("sec-websocket-key"), Some(SAMPLE_KEY));
        assert_eq!(head.host(), Some("server.example.com"));
    }

    #[test]
    fn parse_partial_request() {
        let partial = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n";
        assert!(parse_request(partial).unwrap().is_none());
    }

    #[test]
    fn subprotocol_list_parsing() {
        assert_eq!(
            split_header_list("chat, superchat ,v2"),
            vec!["chat", "superchat", "v2"]
        );
        assert!(split_header_list("").is_empty());
    }

    #[test]
    fn request_builder_sets_core_headers() {
        let request = build_request(
            "example.com",
            "/ws",
            SAMPLE_KEY,
            &["chat".to_string()],
            &[("Authorization".to_string(), "Bearer t".to_string())],
        );
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", SAMPLE_KEY)));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Authorization: Bearer t\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_builder_drops_reserved_user_headers() {
        let request = build_request(
            "example.com",
            "/",
            SAMPLE_KEY,
            &[],
            &[("Sec-WebSocket-Version".to_string(), "8".to_string())],
        );
        let text = std::str::from_utf8(&request).unwrap();
        assert!(!text.contains("Sec-WebSocket-Version: 8"));
        assert!(text.contains("Sec-WebSocket-Version: 13"));
    }

    #[test]
    fn request_builder_sends_empty_protocol_header() {
        // The header goes out even with no subprotocols advertised.
        let request = build_request("example.com", "/", SAMPLE_KEY, &[], &[]);
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: \r\n"));
    }

    #[test]
    fn response_builder() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", Some("chat"));
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\n"));
        assert!(text.contains("Upgrade: websocket\n"));
        assert!(text.contains("Connection: upgrade\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\n"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn response_parses_with_lf_endings() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", None);
        let (head, consumed) = parse_response(&response).unwrap().unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(consumed, response.len());
        assert_eq!(
            head.header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn validate_response_accepts_valid() {
        let head = ResponseHead {
            status: 101,
            headers: vec![
                ("Upgrade".to_string(), "WebSocket".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                (
                    "Sec-WebSocket-Accept".to_string(),
                    make_accept_key(SAMPLE_KEY),
                ),
            ],
        };
        assert!(validate_response(&head, SAMPLE_KEY, &[]).is_ok());
    }

    #[test]
    fn validate_response_rejects_in_order() {
        let mut head = ResponseHead {
            status: 200,
            headers: vec![],
        };
        assert!(matches!(
            validate_response(&head, SAMPLE_KEY, &[]),
            Err(Error::Handshake(reason)) if reason.contains("101")
        ));

        head.status = 101;
        assert!(matches!(
            validate_response(&head, SAMPLE_KEY, &[]),
            Err(Error::Handshake(reason)) if reason.contains("Upgrade")
        ));

        head.headers.push(("Upgrade".to_string(), "websocket".to_string()));
        head.headers.push(("Connection".to_string(), "upgrade".to_string()));
        head.headers
            .push(("Sec-WebSocket-Accept".to_string(), "bogus".to_string()));
        assert!(matches!(
            validate_response(&head, SAMPLE_KEY, &[]),
            Err(Error::Handshake(reason)) if reason.contains("challenge key")
        ));
    }

    #[test]
    fn validate_response_rejects_unoffered_subprotocol() {
        let head = ResponseHead {
            status: 101,
            headers: vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "upgrade".to_string()),
                (
                    "Sec-WebSocket-Accept".to_string(),
                    make_accept_key(SAMPLE_KEY),
                ),
                ("Sec-WebSocket-Protocol".to_string(), "graphql".to_string()),
            ],
        };
        assert!(validate_response(&head, SAMPLE_KEY, &["chat".to_string()]).is_err());
        assert!(validate_response(&head, SAMPLE_KEY, &["graphql".to_string()]).is_ok());
    }

    #[test]
    fn validate_request_accepts_sample() {
        assert!(validate_request(&sample_request()).is_ok());
        assert!(validate_version(&sample_request()).is_ok());
    }

    #[test]
    fn validate_request_rejects_bad_method() {
        let mut head = sample_request();
        head.method = "POST".to_string();
        assert!(matches!(
            validate_request(&head),
            Err(Error::Handshake(reason)) if reason.contains("GET")
        ));
    }

    #[test]
    fn validate_request_rejects_old_http() {
        let mut head = sample_request();
        head.version = 0;
        assert!(matches!(
            validate_request(&head),
            Err(Error::Handshake(reason)) if reason.contains("1.1")
        ));
    }

    #[test]
    fn validate_request_rejects_bad_key() {
        let mut head = sample_request();
        for (name, value) in &mut head.headers {
            if name.eq_ignore_ascii_case("sec-websocket-key") {
                *value = "c2hvcnQ=".to_string(); // decodes to 5 bytes
            }
        }
        assert!(matches!(
            validate_request(&head),
            Err(Error::Handshake(reason)) if reason.contains("16 bytes")
        ));
    }

    #[test]
    fn validate_version_rejects_mismatch() {
        let mut head = sample_request();
        for (name, value) in &mut head.headers {
            if name.eq_ignore_ascii_case("sec-websocket-version") {
                *value = "14".to_string();
            }
        }
        assert!(validate_version(&head).is_err());
    }
}
