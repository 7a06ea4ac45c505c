//! Aergo P2P codec for message framing.
//!
//! Every frame is a fixed 48-byte header followed by the payload:
//!
//! ```text
//! +-------------+----------+-----------+------------+-------------+
//! | subprotocol |  length  | timestamp | message id | original id |
//! |   4 bytes   | 4 bytes  |  8 bytes  |  16 bytes  |  16 bytes   |
//! +-------------+----------+-----------+------------+-------------+
//! |                    Payload (length bytes)                     |
//! +---------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. The original id is the request id when
//! the frame is a response and all zero otherwise.

use crate::message::SubProtocol;
use crate::types::now_unix_nanos;
use crate::{NetworkError, MAX_PAYLOAD_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};
use uuid::Uuid;

/// Header size: subprotocol (4) + length (4) + timestamp (8) + id (16) + original id (16).
pub const HEADER_SIZE: usize = 48;

/// 128-bit message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgId(Uuid);

impl MsgId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier used as "no original id".
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({})", self.0)
    }
}

/// A framed message with an undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subprotocol: SubProtocol,
    /// Creation time in unix nanoseconds.
    pub timestamp: i64,
    pub id: MsgId,
    pub original_id: MsgId,
    pub payload: Bytes,
}

impl Message {
    /// New request or notice stamped with the current time and a fresh id.
    pub fn new(subprotocol: SubProtocol, payload: Bytes) -> Self {
        Self {
            subprotocol,
            timestamp: now_unix_nanos(),
            id: MsgId::new(),
            original_id: MsgId::nil(),
            payload,
        }
    }

    /// New response to the request `original_id`.
    pub fn new_response(subprotocol: SubProtocol, original_id: MsgId, payload: Bytes) -> Self {
        Self {
            original_id,
            ..Self::new(subprotocol, payload)
        }
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn is_response(&self) -> bool {
        !self.original_id.is_nil()
    }
}

/// Message codec for the Aergo P2P protocol.
pub struct MessageCodec {
    /// Maximum allowed payload size.
    max_size: usize,
}

impl MessageCodec {
    /// Create a new codec with the protocol payload limit.
    pub fn new() -> Self {
        Self {
            max_size: MAX_PAYLOAD_LENGTH,
        }
    }

    /// Create a codec with a custom payload limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        let subprotocol = SubProtocol(src.get_u32());
        src.advance(4);
        let timestamp = src.get_i64();
        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let mut original_id = [0u8; 16];
        src.copy_to_slice(&mut original_id);
        let payload = src.split_to(length).freeze();

        Ok(Some(Message {
            subprotocol,
            timestamp,
            id: MsgId::from_bytes(id),
            original_id: MsgId::from_bytes(original_id),
            payload,
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.payload.len();
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32(item.subprotocol.0);
        dst.put_u32(length as u32);
        dst.put_i64(item.timestamp);
        dst.put_slice(item.id.as_bytes());
        dst.put_slice(item.original_id.as_bytes());
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Byte stream a session runs on: a TCP socket in production, an
/// in-memory duplex in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased session stream.
pub type BoxStream = Box<dyn AsyncStream>;

/// Framed message stream of a session.
pub type MsgFramed = Framed<BoxStream, MessageCodec>;

/// Writing half of a framed session.
pub type MsgSink = SplitSink<MsgFramed, Message>;

/// Reading half of a framed session.
pub type MsgStream = SplitStream<MsgFramed>;

/// Wrap an authenticated stream in the message codec.
pub fn framed(stream: BoxStream) -> MsgFramed {
    Framed::new(stream, MessageCodec::new())
}
