//! Core record types for the gossip record store
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;
/// Length of an encoded [`RecordSignature`] (public key || signature).
pub const RECORD_SIGNATURE_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

// =============================================================================
// IDENTIFIERS (newtypes for type safety)
// =============================================================================

/// Content hash: BLAKE3("content" || payload). Globally identifies a record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub Bytes32);

/// Signer identifier: BLAKE3("identity" || public_key)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignerHash(pub Bytes32);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for SignerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Position in a node's local insertion sequence.
///
/// Markers are node-local: a marker handed out by one node means nothing to
/// another. `Marker::ORIGIN` lists everything.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Marker(pub u64);

impl Marker {
    pub const ORIGIN: Marker = Marker(0);
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// RECORD
// =============================================================================

/// Signature bytes attached to a record.
///
/// Encoded as `public_key (32) || ed25519_signature (64)`. Kept as raw bytes
/// because records arrive from untrusted peers; length is checked on verify.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSignature(pub Vec<u8>);

impl RecordSignature {
    /// Split into (public key, signature) if the length is right.
    pub fn parts(&self) -> Option<(&[u8; PUBLIC_KEY_LEN], &[u8; SIGNATURE_LEN])> {
        if self.0.len() != RECORD_SIGNATURE_LEN {
            return None;
        }
        let (pk, sig) = self.0.split_at(PUBLIC_KEY_LEN);
        Some((pk.try_into().ok()?, sig.try_into().ok()?))
    }
}

/// Immutable signed record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// BLAKE3("content" || payload)
    pub content_hash: ContentHash,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Author identity hash
    pub signer_hash: SignerHash,
    /// Signature over ("record-sig" || content_hash || signer_hash)
    pub signature: RecordSignature,
    /// Unix millis at creation (informational only)
    pub created_at: u64,
}

/// A slice of a node's inventory, in insertion order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventorySlice {
    /// Hashes inserted after the requested marker
    pub hashes: Vec<ContentHash>,
    /// Position of the last listed hash (or the requested marker if none)
    pub marker: Marker,
}
