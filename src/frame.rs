//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 frame handling: a bit-precise decoder
//! reading from any buffered async byte source, and an encoder that derives
//! the wire header from the frame contents.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CloseError, Error, Result};
use crate::mask::apply_mask;
use crate::{MAX_FRAME_HEADER_SIZE, MEDIUM_PAYLOAD_THRESHOLD, SMALL_PAYLOAD_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A single WebSocket protocol unit (RFC 6455 section 5.2)
///
/// Frames are produced by [`Frame::read_from`] when decoding inbound traffic,
/// or built by callers for [`Frame::to_bytes`]. The encoder derives the wire
/// `length` and mask bit from `payload` and `key`, so outbound frames only
/// need those two fields filled in besides `fin` and `opcode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask bit as seen on the wire (decode only; encode derives it from `key`)
    pub masked: bool,
    /// Payload length as seen on the wire (decode only; encode derives it from `payload`)
    pub length: u64,
    /// Masking key, present iff the payload was (or is to be) masked
    pub key: Option<[u8; 4]>,
    /// Payload bytes, already unmasked after decode
    pub payload: Bytes,
}

impl Frame {
    /// Create a final frame with the given opcode and payload
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            fin: true,
            opcode,
            masked: false,
            length: payload.len() as u64,
            key: None,
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Create a close frame carrying the given status code and reason
    #[inline]
    pub fn close(reason: &CloseError) -> Self {
        Self::new(OpCode::Close, reason.to_bytes())
    }

    /// Decode one frame from a buffered byte source.
    ///
    /// Reads are exact-length: each section loops until its byte count is
    /// satisfied, regardless of how the underlying reader chunks the stream.
    /// Protocol violations surface as [`Error::Protocol`] carrying the close
    /// reason to send back; I/O failures terminate the decode as
    /// [`Error::Io`].
    pub async fn read_from<R>(reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        // First 2 bytes: FIN, RSV1-3, opcode, mask bit, 7-bit length.
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        let fin = head[0] & 0x80 != 0;

        // RSV1-3 signal extensions, which this library does not negotiate.
        if head[0] & 0x70 != 0 {
            return Err(Error::Protocol(CloseError::new(
                CloseError::PROTOCOL_ERROR,
                "no support for extensions",
            )));
        }

        let opcode_bits = head[0] & 0x0F;
        let opcode = OpCode::from_u8(opcode_bits).ok_or_else(|| {
            Error::Protocol(CloseError::new(
                CloseError::PROTOCOL_ERROR,
                format!("unsupported opcode: {}", opcode_bits),
            ))
        })?;

        let masked = head[1] & 0x80 != 0;

        // 126 and 127 select the 16-bit and 64-bit extended length fields.
        let mut length = u64::from(head[1] & 0x7F);
        if length == 126 {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            length = u64::from(u16::from_be_bytes(ext));
        } else if length == 127 {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            length = extended_length_64(ext);
        }

        let key = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }

        Ok(Frame {
            fin,
            opcode,
            masked,
            length,
            key,
            payload: payload.into(),
        })
    }

    /// Encode the frame into wire bytes.
    ///
    /// The `length` and `masked` fields are ignored: the length marker comes
    /// from `payload.len()` and the mask bit from `key`. When a key is
    /// present the payload is masked into the output buffer; the frame's own
    /// payload is left untouched.
    pub fn to_bytes(&self) -> Bytes {
        let payload_len = self.payload.len();
        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + payload_len);

        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        buf.put_u8(b0);

        let mask_bit = if self.key.is_some() { 0x80 } else { 0x00 };

        if payload_len <= SMALL_PAYLOAD_THRESHOLD {
            buf.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= MEDIUM_PAYLOAD_THRESHOLD {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(payload_len as u64);
        }

        match self.key {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.put_slice(&self.payload),
        }

        buf.freeze()
    }
}

/// Interpret the 8-byte extended payload length: big-endian with the most
/// significant bit cleared.
#[inline]
fn extended_length_64(ext: [u8; 8]) -> u64 {
    u64::from_be_bytes(ext) & 0x7FFF_FFFF_FFFF_FFFF
}
