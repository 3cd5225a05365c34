//! WebSocket server endpoint
//!
//! [`UpgradeRequest`] validates an inbound HTTP upgrade request on a raw
//! stream and, on success, writes the 101 response and hands the transport
//! to a [`Socket`] in server role. Failures answer with the HTTP status the
//! RFC prescribes (403 for origin, 426 for version, 400 otherwise) before
//! returning the error.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::handshake::{
    build_response, make_accept_key, read_request, validate_request, validate_version, RequestHead,
};
use crate::socket::Socket;
use crate::WS_VERSION;

type OriginPredicate = Box<dyn Fn(&RequestHead) -> bool + Send + Sync>;

/// Server-side view of a pending upgrade: an origin policy and an optional
/// chosen subprotocol, applied to inbound streams via
/// [`accept`](UpgradeRequest::accept).
///
/// # Example
///
/// ```ignore
/// use wavesock::UpgradeRequest;
///
/// let upgrade = UpgradeRequest::new().subprotocol("chat");
/// let (mut socket, request) = upgrade.accept(stream).await?;
/// ```
#[derive(Default)]
pub struct UpgradeRequest {
    check_origin: Option<OriginPredicate>,
    subprotocol: Option<String>,
}

impl UpgradeRequest {
    /// Create an acceptor with the default origin policy and no subprotocol.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the origin check. The default allows requests whose `Origin`
    /// header (with any `http://` or `https://` prefix stripped) equals the
    /// request's `Host`, or is absent.
    pub fn check_origin(
        mut self,
        predicate: impl Fn(&RequestHead) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_origin = Some(Box::new(predicate));
        self
    }

    /// Choose a subprotocol to accept. Echoed in the 101 response only when
    /// the client offered it via `Sec-WebSocket-Protocol`.
    pub fn subprotocol(mut self, name: impl Into<String>) -> Self {
        self.subprotocol = Some(name.into());
        self
    }

    /// Read and validate the client's opening handshake on `stream`,
    /// write the 101 response, and return the upgraded [`Socket`] together
    /// with the parsed request head.
    ///
    /// Validation runs in RFC order: origin (403 on failure), websocket
    /// version (426 with a `Sec-WebSocket-Version: 13` header), then the
    /// remaining request requirements (400). Each failure writes its HTTP
    /// rejection before returning [`Error::Handshake`].
    pub async fn accept<S>(&self, mut stream: S) -> Result<(Socket, RequestHead)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (head, leftover) = read_request(&mut stream).await?;

        let origin_ok = match &self.check_origin {
            Some(predicate) => predicate(&head),
            None => default_check_origin(&head),
        };
        if !origin_ok {
            tracing::debug!(origin = ?head.origin(), "rejecting cross-origin upgrade");
            write_rejection(&mut stream, "403 Forbidden", &[]).await;
            return Err(Error::Handshake("origin check failed".to_string()));
        }

        if let Err(e) = validate_version(&head) {
            write_rejection(
                &mut stream,
                "426 Upgrade Required",
                &[("Sec-WebSocket-Version", WS_VERSION)],
            )
            .await;
            return Err(e);
        }

        if let Err(e) = validate_request(&head) {
            write_rejection(&mut stream, "400 Bad Request", &[]).await;
            return Err(e);
        }

        let key = head.header("sec-websocket-key").unwrap_or("");
        let accept_key = make_accept_key(key);

        // Echo the chosen subprotocol only if the client offered it.
        let offered = head.subprotocols();
        let chosen = self
            .subprotocol
            .as_deref()
            .filter(|name| offered.iter().any(|p| p == name));

        let response = build_response(&accept_key, chosen);
        stream.write_all(&response).await?;
        stream.flush().await?;

        tracing::debug!(path = %head.path, protocol = ?chosen, "websocket upgrade accepted");

        Ok((Socket::from_stream(stream, true, leftover), head))
    }
}

/// Default origin policy: allow non-browser clients (no `Origin` header) and
/// same-origin requests (RFC 6455 section 4.2).
fn default_check_origin(head: &RequestHead) -> bool {
    let origin = head.origin().unwrap_or("");
    let origin = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .unwrap_or(origin);

    origin.is_empty() || Some(origin) == head.host()
}

/// Best-effort HTTP rejection; handshake failures do not care whether the
/// peer actually received it.
async fn write_rejection<S>(stream: &mut S, status: &str, headers: &[(&str, &str)])
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"Content-Length: 0\r\nConnection: close\r\n\r\n");

    let _ = stream.write_all(&buf).await;
    let _ = stream.flush().await;
}
