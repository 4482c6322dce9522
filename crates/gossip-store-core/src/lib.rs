//! Gossip Store Core Library
//!
//! This crate provides the record types, canonical encoding, hash derivations
//! and signing identity shared by every node of the gossip record store.
//!
//! # Modules
//!
//! - [`types`]: Core types (ContentHash, SignerHash, Record, Marker)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Domain-separated hash derivations
//! - [`identity`]: Node keypair, record signing and verification
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use identity::Identity;
pub use types::*;
