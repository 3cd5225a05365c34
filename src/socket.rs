//! WebSocket socket state machine
//!
//! A [`Socket`] owns an upgraded transport and drives the RFC 6455
//! connection lifecycle: the read loop decodes frames and dispatches them to
//! a [`Handler`], writes are serialized through a mutex and may originate
//! from any task, and the closing handshake sequences teardown under normal
//! closure, protocol violations, transport errors, and deadlines.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, WriteHalf,
};
use tokio::sync::{Mutex, Notify};

use crate::error::{CloseError, Error, Result};
use crate::frame::{Frame, OpCode};
use crate::mask::make_mask_key;

/// Socket is open and exchanging frames
const OPENED: u8 = 0;
/// A close frame has been sent or is being acknowledged
const CLOSING: u8 = 1;
/// The transport has been torn down
const CLOSED: u8 = 2;

/// Type-erased transport the socket runs over (TCP, TLS, or an in-memory
/// stream in tests)
pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S: AsyncRead + AsyncWrite + Send + Unpin> Transport for S {}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = BufWriter<WriteHalf<Box<dyn Transport>>>;

/// Handler capability invoked by the read loop.
///
/// All methods run on the reader task, in wire order; a method that blocks
/// blocks the read loop. Each method receives a [`SocketHandle`] so it can
/// send frames or initiate a close without holding the socket itself.
pub trait Handler: Send {
    /// Called for every text or binary frame with its opcode and payload.
    fn on_message(
        &mut self,
        socket: &SocketHandle,
        opcode: OpCode,
        payload: Bytes,
    ) -> impl Future<Output = ()> + Send {
        let _ = (socket, opcode, payload);
        async {}
    }

    /// Called for every ping frame. The default replies with a pong carrying
    /// the identical payload (RFC 6455 section 5.5.3).
    fn on_ping(&mut self, socket: &SocketHandle, payload: Bytes) -> impl Future<Output = ()> + Send {
        async move {
            let _ = socket.write(OpCode::Pong, &payload).await;
        }
    }

    /// Called for every pong frame. The default does nothing.
    fn on_pong(&mut self, socket: &SocketHandle, payload: Bytes) -> impl Future<Output = ()> + Send {
        let _ = (socket, payload);
        async {}
    }

    /// Called once when the transport is torn down, with the close reason
    /// memoed during the connection (local or remote), if any.
    fn on_close(&mut self, error: Option<CloseError>) -> impl Future<Output = ()> + Send {
        let _ = error;
        async {}
    }
}

struct Shared {
    writer: Mutex<Writer>,
    state: AtomicU8,
    server: bool,
    close_delay: parking_lot::Mutex<Duration>,
    read_deadline: parking_lot::Mutex<Option<Duration>>,
    write_deadline: parking_lot::Mutex<Option<Duration>>,
    close_error: parking_lot::Mutex<Option<CloseError>>,
    close_notified: AtomicBool,
    shutdown: Notify,
}

/// A live WebSocket endpoint.
///
/// Created by [`Dialer::dial`](crate::Dialer::dial) (client) or
/// [`UpgradeRequest::accept`](crate::UpgradeRequest::accept) (server), or
/// from an already-upgraded stream via [`Socket::client`]/[`Socket::server`].
/// Owns the transport; [`listen`](Self::listen) runs the read loop while
/// writes go through the shared [`SocketHandle`].
pub struct Socket {
    reader: BufReader<BoxedReader>,
    handle: SocketHandle,
}

/// Clonable write/close capability for a [`Socket`].
///
/// Handles can be held by handler implementations or other tasks; all writes
/// funnel through one mutex, so concurrent writers see per-frame atomicity.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

impl Socket {
    /// Wrap an already-upgraded stream as a client endpoint (outbound frames
    /// are masked).
    pub fn client<S>(stream: S) -> Socket
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_stream(stream, false, Bytes::new())
    }

    /// Wrap an already-upgraded stream as a server endpoint (inbound frames
    /// must be masked).
    pub fn server<S>(stream: S) -> Socket
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_stream(stream, true, Bytes::new())
    }

    /// `leftover` holds bytes the handshake read past the HTTP head; they are
    /// replayed before the transport is read again.
    pub(crate) fn from_stream<S>(stream: S, server: bool, leftover: Bytes) -> Socket
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn Transport> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        let reader: BoxedReader = if leftover.is_empty() {
            Box::new(read_half)
        } else {
            Box::new(AsyncReadExt::chain(io::Cursor::new(leftover), read_half))
        };

        Socket {
            reader: BufReader::new(reader),
            handle: SocketHandle {
                shared: Arc::new(Shared {
                    writer: Mutex::new(BufWriter::new(write_half)),
                    state: AtomicU8::new(OPENED),
                    server,
                    close_delay: parking_lot::Mutex::new(Duration::ZERO),
                    read_deadline: parking_lot::Mutex::new(None),
                    write_deadline: parking_lot::Mutex::new(None),
                    close_error: parking_lot::Mutex::new(None),
                    close_notified: AtomicBool::new(false),
                    shutdown: Notify::new(),
                }),
            },
        }
    }

    /// Get a clonable handle for writing from other tasks or from handler
    /// methods.
    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }

    /// Run the read loop until the connection reaches a terminal state,
    /// dispatching frames to `handler` in wire order.
    ///
    /// Returns once the transport has been torn down; `handler.on_close`
    /// fires exactly once, with the memoed close reason, before this method
    /// returns.
    pub async fn listen<H: Handler>(&mut self, handler: &mut H) {
        let handle = self.handle.clone();
        let shared = &handle.shared;

        loop {
            if shared.state.load(Ordering::Acquire) == CLOSED {
                break;
            }

            let deadline = *shared.read_deadline.lock();
            let result = tokio::select! {
                // An externally initiated teardown wakes the loop out of a
                // blocked read.
                _ = shared.shutdown.notified() => break,
                res = read_frame(&mut self.reader, deadline) => res,
            };

            // A teardown may have raced the decode.
            if shared.state.load(Ordering::Acquire) == CLOSED {
                break;
            }

            let frame = match result {
                Ok(frame) => frame,
                Err(Error::Protocol(close)) => {
                    // Protocol violations are reported to the peer in a
                    // close frame before the transport goes down.
                    let _ = handle.close_with_error(close).await;
                    handle.teardown_delayed().await;
                    break;
                }
                Err(Error::Io(e)) => {
                    // EOF and network failures (including deadline expiry)
                    // mean the peer is unreachable: skip the close handshake.
                    tracing::debug!(error = %e, "transport error in read loop");
                    handle.memo_close_error(CloseError::abnormal());
                    handle.tcp_close().await;
                    break;
                }
                Err(_) => {
                    let _ = handle
                        .close_with_error(CloseError::new(
                            CloseError::PROTOCOL_ERROR,
                            "protocol error",
                        ))
                        .await;
                    handle.teardown_delayed().await;
                    break;
                }
            };

            // Inbound masking is mandatory client-to-server and forbidden
            // server-to-client (RFC 6455 section 5.1).
            if shared.server && frame.key.is_none() {
                let _ = handle
                    .close_with_error(CloseError::new(
                        CloseError::PROTOCOL_ERROR,
                        "expected payload to be masked",
                    ))
                    .await;
                handle.teardown_delayed().await;
                break;
            }
            if !shared.server && frame.key.is_some() {
                let _ = handle
                    .close_with_error(CloseError::new(
                        CloseError::PROTOCOL_ERROR,
                        "expected payload to not be masked",
                    ))
                    .await;
                handle.teardown_delayed().await;
                break;
            }

            tracing::trace!(opcode = ?frame.opcode, len = frame.payload.len(), "frame received");

            match frame.opcode {
                OpCode::Text | OpCode::Binary => {
                    handler.on_message(&handle, frame.opcode, frame.payload).await;
                }
                // Fragmentation is not supported; a stray continuation frame
                // is dropped.
                OpCode::Continuation => {}
                OpCode::Ping => {
                    handler.on_ping(&handle, frame.payload).await;
                }
                OpCode::Pong => {
                    handler.on_pong(&handle, frame.payload).await;
                }
                OpCode::Close => {
                    let (close, echo) = match CloseError::from_bytes(&frame.payload) {
                        Ok(close) => {
                            // The acknowledgement echoes the status code.
                            let echo = Bytes::copy_from_slice(&close.code_bytes());
                            (close, echo)
                        }
                        // An invalid status code gets the NoStatusReceived
                        // default and an empty acknowledgement payload.
                        Err(_) => (CloseError::no_status(), Bytes::new()),
                    };
                    tracing::debug!(code = close.code, "close frame received");
                    handle.memo_close_error(close);

                    if shared.state.load(Ordering::Acquire) == CLOSING {
                        // The peer acknowledged the close we initiated.
                        handle.teardown_delayed().await;
                        break;
                    }

                    // Peer-initiated close: acknowledge, then tear down.
                    let _ = shared.state.compare_exchange(
                        OPENED,
                        CLOSING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    let _ = handle.write(OpCode::Close, &echo).await;
                    handle.teardown_delayed().await;
                    break;
                }
            }
        }

        if !shared.close_notified.swap(true, Ordering::AcqRel) {
            let error = shared.close_error.lock().clone();
            handler.on_close(error).await;
        }
    }

    /// Send a frame; see [`SocketHandle::write`].
    pub async fn write(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.handle.write(opcode, payload).await
    }

    /// Initiate the normal-closure (1000) closing handshake; see
    /// [`SocketHandle::close`].
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }

    /// Initiate the closing handshake with a specific reason; see
    /// [`SocketHandle::close_with_error`].
    pub async fn close_with_error(&self, error: CloseError) -> Result<()> {
        self.handle.close_with_error(error).await
    }

    /// Tear the transport down immediately; see [`SocketHandle::tcp_close`].
    pub async fn tcp_close(&self) {
        self.handle.tcp_close().await
    }

    /// Set the read deadline; see [`SocketHandle::set_read_deadline`].
    pub fn set_read_deadline(&self, deadline: Option<Duration>) {
        self.handle.set_read_deadline(deadline)
    }

    /// Set the write deadline; see [`SocketHandle::set_write_deadline`].
    pub fn set_write_deadline(&self, deadline: Option<Duration>) {
        self.handle.set_write_deadline(deadline)
    }

    /// Set the closing-handshake grace period; see
    /// [`SocketHandle::set_close_delay`].
    pub fn set_close_delay(&self, delay: Duration) {
        self.handle.set_close_delay(delay)
    }

    /// Whether the transport has been torn down.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl SocketHandle {
    /// Send a single final frame with the given opcode and payload.
    ///
    /// Client endpoints attach a fresh random mask key. The write mutex is
    /// held for the duration of the call, so concurrent writers never
    /// interleave within a frame.
    ///
    /// Returns [`Error::SocketClosed`] when the transport is already down. A
    /// flush failure is not returned: the error is memoed and the transport
    /// torn down, surfacing through `on_close`.
    pub async fn write(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;

        if self.shared.state.load(Ordering::Acquire) == CLOSED {
            return Err(Error::SocketClosed);
        }

        let mut frame = Frame::new(opcode, Bytes::copy_from_slice(payload));
        if !self.shared.server {
            frame.key = Some(make_mask_key());
        }
        let bytes = frame.to_bytes();

        if let Err(e) = self.flush_bytes(&mut writer, &bytes).await {
            tracing::debug!(error = %e, "write flush failed, tearing down");
            self.memo_close_error(CloseError::new(CloseError::ABNORMAL, e.to_string()));
            self.tcp_close_locked(&mut writer).await;
            return Ok(());
        }

        if opcode == OpCode::Close {
            let _ = self.shared.state.compare_exchange(
                OPENED,
                CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        Ok(())
    }

    /// Initiate the closing handshake with `{1000, "normal closure"}`.
    pub async fn close(&self) -> Result<()> {
        self.close_with_error(CloseError::normal()).await
    }

    /// Initiate the closing handshake with a specific reason.
    ///
    /// Memos the reason and sends it as a close frame. The transport stays
    /// open until the read loop sees the peer's acknowledgement, or an EOF
    /// or timeout.
    pub async fn close_with_error(&self, error: CloseError) -> Result<()> {
        self.memo_close_error(error.clone());
        let payload = error.to_bytes();
        self.write(OpCode::Close, &payload).await
    }

    /// Tear the transport down immediately, skipping any close-frame
    /// exchange. Idempotent; also wakes a read loop blocked on the peer.
    pub async fn tcp_close(&self) {
        let mut writer = self.shared.writer.lock().await;
        self.tcp_close_locked(&mut writer).await;
    }

    /// Set the deadline applied to each frame read in the read loop, or
    /// `None` for no timeout. Expiry is treated as a transport failure: the
    /// socket reports `{1006, "abnormal closure"}` without a close-frame
    /// exchange.
    pub fn set_read_deadline(&self, deadline: Option<Duration>) {
        *self.shared.read_deadline.lock() = deadline;
    }

    /// Set the deadline applied to each frame write, or `None` for no
    /// timeout.
    pub fn set_write_deadline(&self, deadline: Option<Duration>) {
        *self.shared.write_deadline.lock() = deadline;
    }

    /// Set how long the socket waits after the closing handshake completes
    /// before dropping the TCP connection itself.
    ///
    /// The RFC suggests the server should be the one to drop TCP first, so
    /// clients may allow a short grace period here. Servers should leave
    /// this at zero.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.shared.close_delay.lock() = delay;
    }

    /// Whether the transport has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CLOSED
    }

    /// First memo wins: the reason recorded when the closure began is the
    /// one reported to `on_close`.
    fn memo_close_error(&self, error: CloseError) {
        let mut memo = self.shared.close_error.lock();
        if memo.is_none() {
            *memo = Some(error);
        }
    }

    async fn flush_bytes(&self, writer: &mut Writer, bytes: &[u8]) -> io::Result<()> {
        let deadline = *self.shared.write_deadline.lock();
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match deadline {
            Some(limit) => tokio::time::timeout(limit, write).await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            }),
            None => write.await,
        }
    }

    async fn tcp_close_locked(&self, writer: &mut Writer) {
        if self.shared.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        tracing::debug!(server = self.shared.server, "closing transport");
        let _ = writer.shutdown().await;
        // notify_one stores a permit, so a read loop that is between reads
        // still observes the teardown on its next iteration.
        self.shared.shutdown.notify_one();
    }

    /// Complete the closing handshake: wait out the configured grace period,
    /// then close the transport.
    async fn teardown_delayed(&self) {
        if self.shared.state.load(Ordering::Acquire) == CLOSED {
            return;
        }
        let delay = *self.shared.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.tcp_close().await;
    }
}

async fn read_frame<R>(reader: &mut R, deadline: Option<Duration>) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, Frame::read_from(reader)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "read deadline exceeded",
            ))),
        },
        None => Frame::read_from(reader).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Recorder {
        messages: mpsc::UnboundedSender<(OpCode, Bytes)>,
        pongs: mpsc::UnboundedSender<Bytes>,
        closes: mpsc::UnboundedSender<Option<CloseError>>,
    }

    fn recorder() -> (
        Recorder,
        mpsc::UnboundedReceiver<(OpCode, Bytes)>,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<Option<CloseError>>,
    ) {
        let (messages, messages_rx) = mpsc::unbounded_channel();
        let (pongs, pongs_rx) = mpsc::unbounded_channel();
        let (closes, closes_rx) = mpsc::unbounded_channel();
        (
            Recorder {
                messages,
                pongs,
                closes,
            },
            messages_rx,
            pongs_rx,
            closes_rx,
        )
    }

    impl Handler for Recorder {
        async fn on_message(&mut self, _socket: &SocketHandle, opcode: OpCode, payload: Bytes) {
            let _ = self.messages.send((opcode, payload));
        }

        async fn on_pong(&mut self, _socket: &SocketHandle, payload: Bytes) {
            let _ = self.pongs.send(payload);
        }

        async fn on_close(&mut self, error: Option<CloseError>) {
            let _ = self.closes.send(error);
        }
    }

    #[tokio::test]
    async fn server_dispatches_masked_text() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        let (mut handler, mut messages, _, mut closes) = recorder();

        let task = tokio::spawn(async move {
            let (_peer_read, mut peer_write) = tokio::io::split(far);
            let mut frame = Frame::text("hello");
            frame.key = Some([0x37, 0xfa, 0x21, 0x3d]);
            peer_write.write_all(&frame.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();
            // Dropping the peer delivers EOF after the buffered frame.
        });

        let listen = tokio::spawn(async move {
            socket.listen(&mut handler).await;
        });

        let (opcode, payload) = messages.recv().await.unwrap();
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(payload.as_ref(), b"hello");

        task.await.unwrap();
        listen.await.unwrap();
        // Peer dropping without a close frame reports an abnormal closure.
        let close = closes.recv().await.unwrap();
        assert_eq!(close.unwrap().code, CloseError::ABNORMAL);
    }

    #[tokio::test]
    async fn server_rejects_unmasked_frame() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        let (mut handler, _, _, mut closes) = recorder();

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            peer_write
                .write_all(&Frame::text("nope").to_bytes())
                .await
                .unwrap();
            peer_write.flush().await.unwrap();

            // The server must answer with a close frame carrying 1002.
            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Close);
            let close = CloseError::from_bytes(&frame.payload).unwrap();
            assert_eq!(close.code, CloseError::PROTOCOL_ERROR);
            assert_eq!(close.reason, "expected payload to be masked");
        });

        socket.listen(&mut handler).await;
        peer.await.unwrap();

        let close = closes.recv().await.unwrap().unwrap();
        assert_eq!(close.code, CloseError::PROTOCOL_ERROR);
        assert_eq!(close.reason, "expected payload to be masked");
    }

    #[tokio::test]
    async fn client_rejects_masked_frame() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::client(near);
        let (mut handler, _, _, mut closes) = recorder();

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            let mut frame = Frame::text("nope");
            frame.key = Some([1, 2, 3, 4]);
            peer_write.write_all(&frame.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();

            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Close);
            // Client close frames are masked; the decoder unmasks.
            let close = CloseError::from_bytes(&frame.payload).unwrap();
            assert_eq!(close.reason, "expected payload to not be masked");
        });

        socket.listen(&mut handler).await;
        peer.await.unwrap();

        let close = closes.recv().await.unwrap().unwrap();
        assert_eq!(close.reason, "expected payload to not be masked");
    }

    #[tokio::test]
    async fn default_ping_handler_echoes_pong() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);

        struct Quiet;
        impl Handler for Quiet {}

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            let mut ping = Frame::ping(&b"heartbeat"[..]);
            ping.key = Some(make_mask_key());
            peer_write.write_all(&ping.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();

            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Pong);
            assert_eq!(frame.payload.as_ref(), b"heartbeat");
        });

        let listen = tokio::spawn(async move {
            socket.listen(&mut Quiet).await;
        });

        peer.await.unwrap();
        listen.await.unwrap();
    }

    #[tokio::test]
    async fn peer_initiated_close_is_acknowledged() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        let (mut handler, _, _, mut closes) = recorder();

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            let mut close = Frame::close(&CloseError::normal());
            close.key = Some(make_mask_key());
            peer_write.write_all(&close.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();

            // The acknowledgement echoes the bare status code.
            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(frame.payload.as_ref(), &[0x03, 0xE8]);
        });

        socket.listen(&mut handler).await;
        peer.await.unwrap();

        let close = closes.recv().await.unwrap().unwrap();
        assert_eq!(close, CloseError::normal());
    }

    #[tokio::test]
    async fn close_with_invalid_code_gets_empty_ack() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        let (mut handler, _, _, mut closes) = recorder();

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            // Code 2000 is not in the RFC set.
            let mut close = Frame::new(OpCode::Close, &[0x07, 0xD0][..]);
            close.key = Some(make_mask_key());
            peer_write.write_all(&close.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();

            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Close);
            assert!(frame.payload.is_empty());
        });

        socket.listen(&mut handler).await;
        peer.await.unwrap();

        let close = closes.recv().await.unwrap().unwrap();
        assert_eq!(close, CloseError::no_status());
    }

    #[tokio::test(start_paused = true)]
    async fn close_delay_defers_transport_teardown() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        socket.set_close_delay(Duration::from_secs(3));
        let (mut handler, _, _, mut closes) = recorder();

        let peer = tokio::spawn(async move {
            let (mut peer_read, mut peer_write) = tokio::io::split(far);
            let mut close = Frame::close(&CloseError::normal());
            close.key = Some(make_mask_key());
            peer_write.write_all(&close.to_bytes()).await.unwrap();
            peer_write.flush().await.unwrap();

            // The acknowledgement goes out before the grace period starts.
            let frame = Frame::read_from(&mut peer_read).await.unwrap();
            assert_eq!(frame.opcode, OpCode::Close);
        });

        let start = tokio::time::Instant::now();
        socket.listen(&mut handler).await;
        assert!(start.elapsed() >= Duration::from_secs(3));

        peer.await.unwrap();
        assert_eq!(closes.recv().await.unwrap().unwrap(), CloseError::normal());
    }

    #[tokio::test]
    async fn write_after_teardown_returns_socket_closed() {
        let (near, _far) = tokio::io::duplex(1024);
        let socket = Socket::server(near);

        socket.tcp_close().await;
        assert!(socket.is_closed());
        match socket.write(OpCode::Text, b"late").await {
            Err(Error::SocketClosed) => {}
            other => panic!("expected SocketClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_deadline_tears_down_without_close_exchange() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        socket.set_read_deadline(Some(Duration::from_millis(20)));
        let (mut handler, _, _, mut closes) = recorder();

        // The peer stays silent; the deadline must fire.
        socket.listen(&mut handler).await;

        let close = closes.recv().await.unwrap().unwrap();
        assert_eq!(close, CloseError::abnormal());
        drop(far);
    }

    #[tokio::test]
    async fn external_tcp_close_wakes_listen() {
        let (near, far) = tokio::io::duplex(1024);
        let mut socket = Socket::server(near);
        let handle = socket.handle();
        let (mut handler, _, _, mut closes) = recorder();

        let listen = tokio::spawn(async move {
            socket.listen(&mut handler).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.tcp_close().await;

        listen.await.unwrap();
        assert!(closes.recv().await.unwrap().is_none());
        drop(far);
    }

    #[tokio::test]
    async fn frames_dispatch_in_wire_order() {
        let (near, far) = tokio::io::duplex(4096);
        let mut socket = Socket::server(near);
        let (mut handler, mut messages, _, _) = recorder();

        let peer = tokio::spawn(async move {
            let (_peer_read, mut peer_write) = tokio::io::split(far);
            for i in 0..5u8 {
                let mut frame = Frame::binary(vec![i]);
                frame.key = Some(make_mask_key());
                peer_write.write_all(&frame.to_bytes()).await.unwrap();
            }
            peer_write.flush().await.unwrap();
        });

        let listen = tokio::spawn(async move {
            socket.listen(&mut handler).await;
        });

        for i in 0..5u8 {
            let (opcode, payload) = messages.recv().await.unwrap();
            assert_eq!(opcode, OpCode::Binary);
            assert_eq!(payload.as_ref(), &[i]);
        }

        peer.await.unwrap();
        listen.await.unwrap();
    }
}
