//! Gossip wire messages
//!
//! Every message travels as one [`Frame`] whose type byte selects the
//! variant and whose payload is the postcard encoding of the body. Frames
//! are decoded and checked against [`MessageLimits`] at the transport
//! boundary, so the engine only ever sees well-formed messages.

use crate::framing::{Frame, FrameType};
use gossip_store_core::canonical::has_duplicate_hashes;
use gossip_store_core::types::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors (malformed or out-of-limit messages)
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed {0:?} payload: {1}")]
    Malformed(FrameType, postcard::Error),
    #[error("Encoding failed: {0}")]
    Encode(postcard::Error),
    #[error("Too many hashes: {0} (max {1})")]
    TooManyHashes(usize, usize),
    #[error("Duplicate hash in request")]
    DuplicateHashes,
    #[error("Record payload too large: {0} bytes (max {1})")]
    PayloadTooLarge(usize, usize),
    #[error("Unexpected response: expected {expected}, got {got:?}")]
    UnexpectedResponse {
        expected: &'static str,
        got: FrameType,
    },
}

/// Encoded size of a record's fixed fields, rounded up
pub const RECORD_OVERHEAD: usize = 256;

/// Bytes a record occupies inside a message body (upper bound)
pub fn record_wire_bytes(record: &Record) -> usize {
    record.payload.len() + RECORD_OVERHEAD
}

/// Size limits enforced on decoded messages
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    /// Maximum hashes in any single list
    pub max_hashes: usize,
    /// Maximum payload bytes of a single record
    pub max_record_bytes: usize,
    /// Record bytes a responder packs into one fetch response
    pub max_batch_bytes: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_hashes: 10_000,
            max_record_bytes: 1024 * 1024,
            max_batch_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Requester's inventory summary
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryRequest {
    /// Responder marker the requester has fully synced up to
    pub known_marker: Marker,
    /// Requester hashes inserted since its own last synced marker
    pub hashes: Vec<ContentHash>,
    /// Requester marker covering `hashes`
    pub marker: Marker,
}

/// Responder's view of the inventory difference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryResponse {
    /// Hashes the responder has that the requester did not list
    pub hashes_they_have: Vec<ContentHash>,
    /// Listed requester hashes the responder lacks
    pub hashes_they_want: Vec<ContentHash>,
    /// Leading requester hashes the responder examined; the rest wait for
    /// a later round
    pub covered: u32,
    /// Responder marker covering `hashes_they_have`
    pub marker: Marker,
}

/// Fetch records by hash (batched)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchRequest {
    pub hashes: Vec<ContentHash>,
}

/// One fetch result
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchEntry {
    Found(Record),
    NotFound(ContentHash),
    /// Left out to keep the response within its byte budget; ask again
    Deferred(ContentHash),
}

/// Fetch results, one per requested hash
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchResponse {
    pub entries: Vec<FetchEntry>,
}

/// Push a record the peer is missing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushRecord {
    pub record: Record,
}

/// How a pushed record was received
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushStatus {
    Stored,
    Duplicate,
    Rejected(String),
}

/// Acknowledgement of a [`PushRecord`]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushAck {
    pub hash: ContentHash,
    pub status: PushStatus,
}

/// Request could not be served
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMessage {
    pub reason: String,
}

/// The fixed set of gossip messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping,
    Pong,
    InventoryRequest(InventoryRequest),
    InventoryResponse(InventoryResponse),
    FetchRequest(FetchRequest),
    FetchResponse(FetchResponse),
    PushRecord(PushRecord),
    PushAck(PushAck),
    Error(ErrorMessage),
}

fn encode<T: Serialize>(frame_type: FrameType, body: &T) -> Result<Frame, ProtocolError> {
    let payload = postcard::to_allocvec(body).map_err(ProtocolError::Encode)?;
    Ok(Frame::new(frame_type, payload))
}

fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    postcard::from_bytes(&frame.payload).map_err(|e| ProtocolError::Malformed(frame.frame_type, e))
}

impl Message {
    /// Frame type carrying this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Ping => FrameType::Ping,
            Message::Pong => FrameType::Pong,
            Message::InventoryRequest(_) => FrameType::InventoryRequest,
            Message::InventoryResponse(_) => FrameType::InventoryResponse,
            Message::FetchRequest(_) => FrameType::FetchRequest,
            Message::FetchResponse(_) => FrameType::FetchResponse,
            Message::PushRecord(_) => FrameType::PushRecord,
            Message::PushAck(_) => FrameType::PushAck,
            Message::Error(_) => FrameType::Error,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let frame_type = self.frame_type();
        match self {
            Message::Ping => Ok(Frame::ping()),
            Message::Pong => Ok(Frame::pong()),
            Message::InventoryRequest(m) => encode(frame_type, m),
            Message::InventoryResponse(m) => encode(frame_type, m),
            Message::FetchRequest(m) => encode(frame_type, m),
            Message::FetchResponse(m) => encode(frame_type, m),
            Message::PushRecord(m) => encode(frame_type, m),
            Message::PushAck(m) => encode(frame_type, m),
            Message::Error(m) => encode(frame_type, m),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(match frame.frame_type {
            FrameType::Ping => Message::Ping,
            FrameType::Pong => Message::Pong,
            FrameType::InventoryRequest => Message::InventoryRequest(decode(frame)?),
            FrameType::InventoryResponse => Message::InventoryResponse(decode(frame)?),
            FrameType::FetchRequest => Message::FetchRequest(decode(frame)?),
            FrameType::FetchResponse => Message::FetchResponse(decode(frame)?),
            FrameType::PushRecord => Message::PushRecord(decode(frame)?),
            FrameType::PushAck => Message::PushAck(decode(frame)?),
            FrameType::Error => Message::Error(decode(frame)?),
        })
    }

    /// Check size limits and request hash uniqueness.
    pub fn validate(&self, limits: &MessageLimits) -> Result<(), ProtocolError> {
        let check_hashes = |hashes: &[ContentHash], unique: bool| {
            if hashes.len() > limits.max_hashes {
                return Err(ProtocolError::TooManyHashes(hashes.len(), limits.max_hashes));
            }
            if unique && has_duplicate_hashes(hashes) {
                return Err(ProtocolError::DuplicateHashes);
            }
            Ok(())
        };
        let check_record = |record: &Record| {
            if record.payload.len() > limits.max_record_bytes {
                return Err(ProtocolError::PayloadTooLarge(
                    record.payload.len(),
                    limits.max_record_bytes,
                ));
            }
            Ok(())
        };

        match self {
            Message::InventoryRequest(m) => check_hashes(&m.hashes, true),
            Message::InventoryResponse(m) => {
                check_hashes(&m.hashes_they_have, true)?;
                check_hashes(&m.hashes_they_want, true)
            }
            Message::FetchRequest(m) => check_hashes(&m.hashes, true),
            Message::FetchResponse(m) => {
                if m.entries.len() > limits.max_hashes {
                    return Err(ProtocolError::TooManyHashes(
                        m.entries.len(),
                        limits.max_hashes,
                    ));
                }
                m.entries.iter().try_for_each(|entry| match entry {
                    FetchEntry::Found(record) => check_record(record),
                    FetchEntry::NotFound(_) | FetchEntry::Deferred(_) => Ok(()),
                })
            }
            Message::PushRecord(m) => check_record(&m.record),
            Message::Ping
            | Message::Pong
            | Message::PushAck(_)
            | Message::Error(_) => Ok(()),
        }
    }

    /// Decode and validate in one step (transport boundary).
    pub fn decode_checked(frame: &Frame, limits: &MessageLimits) -> Result<Self, ProtocolError> {
        let message = Self::from_frame(frame)?;
        message.validate(limits)?;
        Ok(message)
    }

    /// Build an error reply
    pub fn error(reason: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gossip_store_core::Identity;

    fn sample_record() -> Record {
        Identity::from_seed(&[1; 32]).create_record_at(b"payload".to_vec(), 7)
    }

    #[test]
    fn test_message_frame_roundtrip() {
        let messages = vec![
            Message::Ping,
            Message::InventoryRequest(InventoryRequest {
                known_marker: Marker(3),
                hashes: vec![ContentHash([1; 32])],
                marker: Marker(9),
            }),
            Message::FetchResponse(FetchResponse {
                entries: vec![
                    FetchEntry::Found(sample_record()),
                    FetchEntry::NotFound(ContentHash([2; 32])),
                    FetchEntry::Deferred(ContentHash([4; 32])),
                ],
            }),
            Message::PushAck(PushAck {
                hash: ContentHash([3; 32]),
                status: PushStatus::Rejected("integrity".into()),
            }),
        ];

        for message in messages {
            let frame = message.to_frame().unwrap();
            assert_eq!(frame.frame_type, message.frame_type());
            assert_eq!(Message::from_frame(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_malformed_payload() {
        let frame = Frame::new(FrameType::PushRecord, vec![0xff, 0xff]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Malformed(FrameType::PushRecord, _))
        ));
    }

    #[test]
    fn test_limits() {
        let limits = MessageLimits {
            max_hashes: 2,
            max_record_bytes: 4,
            ..MessageLimits::default()
        };

        let too_many = Message::FetchRequest(FetchRequest {
            hashes: vec![ContentHash([1; 32]), ContentHash([2; 32]), ContentHash([3; 32])],
        });
        assert!(matches!(
            too_many.validate(&limits),
            Err(ProtocolError::TooManyHashes(3, 2))
        ));

        let dup = Message::FetchRequest(FetchRequest {
            hashes: vec![ContentHash([1; 32]), ContentHash([1; 32])],
        });
        assert!(matches!(
            dup.validate(&limits),
            Err(ProtocolError::DuplicateHashes)
        ));

        let big = Message::PushRecord(PushRecord {
            record: sample_record(),
        });
        assert!(matches!(
            big.validate(&limits),
            Err(ProtocolError::PayloadTooLarge(7, 4))
        ));
        assert!(big.validate(&MessageLimits::default()).is_ok());
    }

    #[test]
    fn test_record_wire_bytes_is_upper_bound() {
        let id = Identity::from_seed(&[1; 32]);
        for len in [0usize, 1, 200, 70_000, 1024 * 1024] {
            let record = id.create_record_at(vec![7; len], u64::MAX);
            let encoded = postcard::to_allocvec(&record).unwrap();
            assert!(encoded.len() <= record_wire_bytes(&record));
        }
    }
}
