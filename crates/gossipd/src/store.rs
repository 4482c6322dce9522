//! Append-only content store with integrity and authenticity checks

use crate::storage::{Storage, StorageError};
use gossip_store_core::crypto::verify_content_hash;
use gossip_store_core::types::*;
use gossip_store_core::Identity;
use gossip_store_net::messages::MessageLimits;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a record was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Payload larger than a record may be on the wire
    TooLarge,
    /// Payload digest does not match the content hash
    Integrity,
    /// Signature does not verify for the claimed signer
    Authenticity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooLarge => write!(f, "SizeError"),
            RejectReason::Integrity => write!(f, "IntegrityError"),
            RejectReason::Authenticity => write!(f, "AuthenticityError"),
        }
    }
}

/// Result of [`ContentStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Inserted at this position
    Stored(Marker),
    /// Hash already present; nothing changed
    Duplicate,
    /// Failed verification; nothing written
    Rejected(RejectReason),
}

impl PutOutcome {
    pub fn stored(&self) -> bool {
        matches!(self, PutOutcome::Stored(_))
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            PutOutcome::Stored(_) => None,
            PutOutcome::Duplicate => Some("duplicate".into()),
            PutOutcome::Rejected(reason) => Some(reason.to_string()),
        }
    }
}

/// Authoritative local record set
///
/// Entries are verified before they are written and never change after.
/// Verification runs without locks, so concurrent puts of different records
/// only serialize on the storage commit.
pub struct ContentStore {
    storage: Arc<Storage>,
    /// Largest payload accepted; anything bigger could never be gossiped
    max_record_bytes: usize,
    /// Records refused by verification since startup
    rejected: AtomicU64,
}

impl ContentStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            max_record_bytes: MessageLimits::default().max_record_bytes,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    /// Verify and insert a record.
    pub fn put(&self, record: &Record) -> Result<PutOutcome, StorageError> {
        if record.payload.len() > self.max_record_bytes {
            warn!(
                "Rejected record {}: {} byte payload (max {})",
                record.content_hash,
                record.payload.len(),
                self.max_record_bytes
            );
            return Ok(self.reject(RejectReason::TooLarge));
        }

        if let Err(e) = verify_content_hash(record) {
            warn!("Rejected record {}: {}", record.content_hash, e);
            return Ok(self.reject(RejectReason::Integrity));
        }

        if !Identity::verify(&record.content_hash, &record.signer_hash, &record.signature) {
            warn!(
                "Rejected record {}: signature invalid for signer {}",
                record.content_hash, record.signer_hash
            );
            return Ok(self.reject(RejectReason::Authenticity));
        }

        match self.storage.insert_record(record)? {
            Some(marker) => {
                debug!("Stored record {} at {}", record.content_hash, marker);
                Ok(PutOutcome::Stored(marker))
            }
            None => Ok(PutOutcome::Duplicate),
        }
    }

    fn reject(&self, reason: RejectReason) -> PutOutcome {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        PutOutcome::Rejected(reason)
    }

    /// Author and store a record signed by `identity`.
    pub fn publish(
        &self,
        identity: &Identity,
        payload: Vec<u8>,
    ) -> Result<(Record, PutOutcome), StorageError> {
        let record = identity.create_record(payload);
        let outcome = self.put(&record)?;
        Ok((record, outcome))
    }

    /// Get a record by hash (`None` = not found)
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Record>, StorageError> {
        self.storage.get_record(hash)
    }

    /// Check if we have a record
    pub fn has(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        self.storage.has_record(hash)
    }

    /// Hashes inserted after `marker`, in insertion order.
    pub fn list_since(&self, marker: Marker, limit: usize) -> Result<InventorySlice, StorageError> {
        self.storage.list_since(marker, limit)
    }

    pub fn current_marker(&self) -> Marker {
        self.storage.current_marker()
    }

    /// Count all records
    pub fn len(&self) -> usize {
        self.storage.record_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// All stored hashes, in insertion order.
    pub fn hashes(&self) -> Result<Vec<ContentHash>, StorageError> {
        Ok(self.list_since(Marker::ORIGIN, usize::MAX)?.hashes)
    }
}
