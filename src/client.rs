//! WebSocket client endpoint
//!
//! [`Dialer`] establishes outbound connections: it parses `ws://`/`wss://`
//! URLs, dials TCP (and TLS for `wss`), performs the opening handshake, and
//! returns a [`Socket`] in client role together with the server's response
//! head.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::handshake::{
    build_request, make_challenge_key, read_response, validate_response, ResponseHead,
};
use crate::socket::Socket;

/// A stream that may or may not be TLS-encrypted.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

// ============================================================================
// URL parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

/// A parsed `ws://host[:port]/path?query` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WsUrl {
    scheme: Scheme,
    /// Host with the port always present
    host: String,
    /// Path plus query, always starting with `/`
    path: String,
}

impl WsUrl {
    /// Parse and normalize a WebSocket URL (RFC 6455 section 3).
    ///
    /// A missing scheme defaults to `ws`; a missing port gets the scheme
    /// default (80 for `ws`, 443 for `wss`).
    fn parse(input: &str) -> Result<WsUrl> {
        let (scheme, rest) = match input.find("://") {
            Some(idx) => {
                let name = &input[..idx];
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphabetic()) {
                    return Err(Error::Handshake(format!("invalid scheme: {}", name)));
                }
                let scheme = match name {
                    s if s.eq_ignore_ascii_case("ws") => Scheme::Ws,
                    s if s.eq_ignore_ascii_case("wss") => Scheme::Wss,
                    other => return Err(Error::Handshake(format!("invalid scheme: {}", other))),
                };
                (scheme, &input[idx + 3..])
            }
            None => (Scheme::Ws, input),
        };

        let (host, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'/' => (&rest[..idx], rest[idx..].to_string()),
            Some(idx) => (&rest[..idx], format!("/{}", &rest[idx..])),
            None => (rest, "/".to_string()),
        };

        if host.is_empty() {
            return Err(Error::Handshake("missing host".to_string()));
        }

        let has_port = host
            .rfind(':')
            .map(|idx| {
                let port = &host[idx + 1..];
                !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
            })
            .unwrap_or(false);

        let host = if has_port {
            host.to_string()
        } else {
            format!("{}:{}", host, scheme.default_port())
        };

        Ok(WsUrl { scheme, host, path })
    }

    /// The `Host` header value: the host with the scheme's default-port
    /// suffix stripped.
    fn host_header(&self) -> &str {
        let default_suffix = match self.scheme {
            Scheme::Ws => ":80",
            Scheme::Wss => ":443",
        };
        self.host.strip_suffix(default_suffix).unwrap_or(&self.host)
    }

    /// The bare host for TLS SNI.
    fn server_name(&self) -> &str {
        match self.host.rfind(':') {
            Some(idx) => &self.host[..idx],
            None => &self.host,
        }
    }
}

// ============================================================================
// Dialer
// ============================================================================

/// A WebSocket client: builder for connection options plus
/// [`dial`](Dialer::dial).
///
/// # Example
///
/// ```ignore
/// use wavesock::Dialer;
///
/// let (mut socket, response) = Dialer::new()
///     .header("Authorization", "Bearer token")
///     .subprotocol("chat")
///     .dial("wss://example.com/ws")
///     .await?;
/// ```
#[derive(Default)]
pub struct Dialer {
    headers: Vec<(String, String)>,
    subprotocols: Vec<String>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Dialer {
    /// Create a dialer with no extra headers, no subprotocols, and the
    /// default TLS configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header to the opening-handshake request. Headers owned by the
    /// handshake itself (`Host`, `Upgrade`, the `Sec-WebSocket-*` family)
    /// cannot be overridden.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Advertise a subprotocol via `Sec-WebSocket-Protocol`. May be called
    /// multiple times.
    pub fn subprotocol(mut self, name: impl Into<String>) -> Self {
        self.subprotocols.push(name.into());
        self
    }

    /// Use a specific TLS client configuration for `wss://` connections
    /// instead of the webpki-roots default.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Connect to a WebSocket server.
    ///
    /// Parses the URL, dials TCP (and TLS when the scheme is `wss`), sends
    /// the opening-handshake request, and validates the server's response,
    /// including the accept key derived from our challenge key. On success
    /// the returned [`Socket`] is open in client role; outbound frames will
    /// be masked.
    pub async fn dial(&self, url: &str) -> Result<(Socket, ResponseHead)> {
        let url = WsUrl::parse(url)?;

        let tcp = TcpStream::connect(&url.host).await?;

        let mut stream = match url.scheme {
            Scheme::Ws => MaybeTlsStream::Plain(tcp),
            Scheme::Wss => {
                let config = self
                    .tls_config
                    .clone()
                    .unwrap_or_else(default_tls_config);
                let server_name = ServerName::try_from(url.server_name().to_string())
                    .map_err(|_| {
                        Error::Handshake(format!("invalid server name: {}", url.server_name()))
                    })?;
                let tls = TlsConnector::from(config)
                    .connect(server_name, tcp)
                    .await?;
                MaybeTlsStream::Tls(tls)
            }
        };

        let key = make_challenge_key();
        let request = build_request(
            url.host_header(),
            &url.path,
            &key,
            &self.subprotocols,
            &self.headers,
        );
        stream.write_all(&request).await?;
        stream.flush().await?;

        let (response, leftover) = read_response(&mut stream).await?;
        validate_response(&response, &key, &self.subprotocols)?;

        tracing::debug!(host = %url.host, path = %url.path, "websocket connection established");

        let socket = Socket::from_stream(stream, false, leftover);
        Ok((socket, response))
    }
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
