//! Message framing for network transport
//!
//! Provides length-prefixed framing with a one-byte message type.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("Empty frame")]
    Empty,
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Inventory summary from a requester
    InventoryRequest = 10,
    /// Inventory difference from a responder
    InventoryResponse = 11,
    /// Request records by hash
    FetchRequest = 12,
    /// Records (or not-found markers) for a fetch
    FetchResponse = 13,
    /// Push one record to a peer
    PushRecord = 14,
    /// Outcome of a push
    PushAck = 15,
    /// Request could not be served
    Error = 20,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            10 => Ok(Self::InventoryRequest),
            11 => Ok(Self::InventoryResponse),
            12 => Ok(Self::FetchRequest),
            13 => Ok(Self::FetchResponse),
            14 => Ok(Self::PushRecord),
            15 => Ok(Self::PushAck),
            20 => Ok(Self::Error),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create codec with a lower frame size ceiling
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(FrameError::Empty);
        }
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }
}
