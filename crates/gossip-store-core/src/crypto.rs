//! Hash derivations for the gossip record store
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! This module provides the normative implementations.

use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for content hash derivation
pub const DOMAIN_CONTENT: &[u8] = b"content";
/// Domain prefix for identity hash derivation
pub const DOMAIN_IDENTITY: &[u8] = b"identity";
/// Domain prefix for record signatures
pub const DOMAIN_RECORD_SIG: &[u8] = b"record-sig";

// =============================================================================
// CONTENT HASH
// =============================================================================

/// Derive the content hash of a payload.
///
/// `ContentHash = BLAKE3("content" || payload)`
pub fn content_hash(payload: &[u8]) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_CONTENT);
    hasher.update(payload);
    ContentHash(*hasher.finalize().as_bytes())
}

/// Verify that a record's content_hash matches its payload.
pub fn verify_content_hash(record: &Record) -> Result<()> {
    let computed = content_hash(&record.payload);
    if computed != record.content_hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(record.content_hash.0),
        });
    }
    Ok(())
}

// =============================================================================
// IDENTITY HASH
// =============================================================================

/// Derive the signer hash from an Ed25519 public key.
///
/// `SignerHash = BLAKE3("identity" || public_key)`
pub fn identity_hash(public_key: &[u8; PUBLIC_KEY_LEN]) -> SignerHash {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_IDENTITY);
    hasher.update(public_key);
    SignerHash(*hasher.finalize().as_bytes())
}

// =============================================================================
// SIGNING BYTES
// =============================================================================

/// Compute the bytes to sign for a record.
///
/// `sign_bytes = "record-sig" || content_hash || signer_hash`
pub fn record_sign_bytes(content_hash: &ContentHash, signer_hash: &SignerHash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_RECORD_SIG.len() + 32 + 32);
    bytes.extend_from_slice(DOMAIN_RECORD_SIG);
    bytes.extend_from_slice(&content_hash.0);
    bytes.extend_from_slice(&signer_hash.0);
    bytes
}
