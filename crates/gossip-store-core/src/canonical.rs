//! Canonical encoding for records and hash lists
//!
//! Stored and transmitted objects use postcard serialization:
//! - No maps/hashmaps
//! - Field order is Rust struct field order
//! - Hash lists carried in requests must not repeat entries

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value from canonical bytes.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Check that a hash list carries no repeated entries.
pub fn has_duplicate_hashes(hashes: &[ContentHash]) -> bool {
    let mut seen = HashSet::with_capacity(hashes.len());
    hashes.iter().any(|h| !seen.insert(*h))
}
