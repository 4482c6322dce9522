//! Node signing identity
//!
//! An [`Identity`] wraps an Ed25519 keypair. Its identity hash is the stable
//! signer id written into every record it authors. Verification is a free
//! function of the record fields and never needs the signer's keypair.

use crate::crypto::{content_hash, identity_hash, record_sign_bytes};
use crate::types::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ed25519 identity for signing records
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    /// Cached BLAKE3("identity" || public_key)
    identity_hash: SignerHash,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("identity_hash", &self.identity_hash)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create from seed bytes (persisted key material, deterministic tests)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let identity_hash = identity_hash(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            identity_hash,
        }
    }

    /// Secret seed, for persistence
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Stable signer id
    pub fn identity_hash(&self) -> SignerHash {
        self.identity_hash
    }

    /// Sign a content hash on behalf of this identity.
    pub fn sign(&self, content_hash: &ContentHash) -> RecordSignature {
        let message = record_sign_bytes(content_hash, &self.identity_hash);
        let signature = self.signing_key.sign(&message);

        let mut bytes = Vec::with_capacity(RECORD_SIGNATURE_LEN);
        bytes.extend_from_slice(&self.public_key());
        bytes.extend_from_slice(&signature.to_bytes());
        RecordSignature(bytes)
    }

    /// Verify a record signature.
    ///
    /// Returns false for malformed signatures, keys that are not valid
    /// curve points, and keys whose identity hash differs from `signer_hash`.
    pub fn verify(
        content_hash: &ContentHash,
        signer_hash: &SignerHash,
        signature: &RecordSignature,
    ) -> bool {
        let Some((public_key, sig)) = signature.parts() else {
            return false;
        };
        if identity_hash(public_key) != *signer_hash {
            return false;
        }
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let message = record_sign_bytes(content_hash, signer_hash);
        verifying_key
            .verify(&message, &Signature::from_bytes(sig))
            .is_ok()
    }

    /// Author a record for `payload`, stamped with the current time.
    pub fn create_record(&self, payload: Vec<u8>) -> Record {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.create_record_at(payload, created_at)
    }

    /// Author a record with an explicit creation time.
    pub fn create_record_at(&self, payload: Vec<u8>, created_at: u64) -> Record {
        let content_hash = content_hash(&payload);
        Record {
            content_hash,
            signature: self.sign(&content_hash),
            signer_hash: self.identity_hash,
            payload,
            created_at,
        }
    }
}
