//! # Wavesock: RFC 6455 WebSocket endpoints for tokio
//!
//! A WebSocket library providing both client and server endpoints over TCP
//! (with optional TLS), built around three pieces:
//!
//! - **Opening handshake**: client request generation, server validation,
//!   response generation, and challenge/accept key derivation
//! - **Frame codec**: bit-precise encoding and decoding of RFC 6455 data
//!   frames, including variable-length fields and masking
//! - **Socket state machine**: frame dispatch to a [`Handler`], control-frame
//!   handling, the closing handshake, and teardown under error or timeout
//!
//! ## Server example
//!
//! ```ignore
//! use wavesock::{Handler, OpCode, SocketHandle, UpgradeRequest};
//! use tokio::net::TcpListener;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn on_message(&mut self, socket: &SocketHandle, opcode: OpCode, payload: bytes::Bytes) {
//!         let _ = socket.write(opcode, &payload).await;
//!     }
//! }
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! while let Ok((stream, _)) = listener.accept().await {
//!     tokio::spawn(async move {
//!         if let Ok((mut socket, _request)) = UpgradeRequest::new().accept(stream).await {
//!             socket.listen(&mut Echo).await;
//!         }
//!     });
//! }
//! ```
//!
//! ## Client example
//!
//! ```ignore
//! use wavesock::{Dialer, OpCode};
//!
//! let (mut socket, _response) = Dialer::new().dial("ws://localhost:8080/chat").await?;
//! socket.write(OpCode::Text, b"hello").await?;
//! socket.listen(&mut MyHandler).await;
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod server;
pub mod socket;

pub use client::Dialer;
pub use error::{CloseError, Error, Result};
pub use frame::{Frame, OpCode};
pub use handshake::{RequestHead, ResponseHead};
pub use server::UpgradeRequest;
pub use socket::{Handler, Socket, SocketHandle};

/// WebSocket GUID salt for accept-key derivation (RFC 6455 section 1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The protocol version this library implements
pub const WS_VERSION: &str = "13";

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field (2-byte header)
pub(crate) const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit extended length field
pub(crate) const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::Dialer;
    pub use crate::error::{CloseError, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::server::UpgradeRequest;
    pub use crate::socket::{Handler, Socket, SocketHandle};
}
