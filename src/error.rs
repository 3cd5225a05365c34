//! Error types for the WebSocket library

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Opening-handshake failure, either direction
    Handshake(String),
    /// Protocol violation, carried as the payload of an outbound CLOSE frame
    Protocol(CloseError),
    /// Close frame carried a status code outside the RFC 6455 set
    InvalidCloseCode(u16),
    /// Write attempted on a socket whose transport has been torn down
    SocketClosed,
}

/// The status code and reason carried in the payload of a CLOSE frame
/// (RFC 6455 section 5.5.1), also used in teardown reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    /// Close status code
    pub code: u16,
    /// Human-readable reason string
    pub reason: String,
}

impl CloseError {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const MANDATORY_EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL_ERROR: u16 = 1011;
    /// TLS handshake failure
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The `{1000, "normal closure"}` reason used by [`close`](crate::SocketHandle::close)
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "normal closure")
    }

    /// The `{1005, "no status received"}` default substituted for unrecognized codes
    pub fn no_status() -> Self {
        Self::new(Self::NO_STATUS, "no status received")
    }

    /// The `{1006, "abnormal closure"}` reason reported when the transport
    /// fails without a close-frame exchange
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "abnormal closure")
    }

    /// Check whether a status code is in the RFC 6455 defined set
    #[inline]
    pub fn is_recognized(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1005..=1011 | 1015)
    }

    /// The 2-byte big-endian encoding of the status code
    #[inline]
    pub fn code_bytes(&self) -> [u8; 2] {
        self.code.to_be_bytes()
    }

    /// Serialize into a CLOSE frame payload: 2-byte big-endian code followed
    /// by the reason bytes.
    ///
    /// An unrecognized status code encodes as the
    /// [`no_status`](Self::no_status) default so the bytes are always usable
    /// as a close-frame payload.
    pub fn to_bytes(&self) -> Bytes {
        if !Self::is_recognized(self.code) {
            return Self::no_status().to_bytes();
        }

        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Parse a CLOSE frame payload.
    ///
    /// A payload shorter than 2 bytes, or one carrying a status code outside
    /// the RFC set, yields [`Error::InvalidCloseCode`]; callers substitute
    /// the [`no_status`](Self::no_status) default.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(Error::InvalidCloseCode(0));
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if !Self::is_recognized(code) {
            return Err(Error::InvalidCloseCode(code));
        }

        Ok(Self {
            code,
            reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
        })
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close error {}: {}", self.code, self.reason)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Handshake(reason) => write!(f, "handshake failed: {}", reason),
            Error::Protocol(close) => write!(f, "protocol error: {} {}", close.code, close.reason),
            Error::InvalidCloseCode(code) => write!(f, "invalid close code: {}", code),
            Error::SocketClosed => write!(f, "socket has been closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
