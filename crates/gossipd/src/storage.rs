//! Persistent storage using sled

use gossip_store_core::types::*;
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupt entry: {0}")]
    Corrupt(String),
}

/// Storage backend for gossipd
pub struct Storage {
    db: Db,
    /// Record tree: content_hash -> Record
    records: sled::Tree,
    /// Insertion index: big-endian sequence -> content_hash
    sequence: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
    /// Last assigned sequence number; held while an insert commits
    last_sequence: Mutex<u64>,
}

fn decode_sequence(key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("sequence key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_hash(value: &[u8]) -> Result<ContentHash, StorageError> {
    let bytes: Bytes32 = value
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("content hash of {} bytes", value.len())))?;
    Ok(ContentHash(bytes))
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a throwaway database that is removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let records = db.open_tree("records")?;
        let sequence = db.open_tree("sequence")?;
        let metadata = db.open_tree("metadata")?;

        let last_sequence = match sequence.last()? {
            Some((key, _)) => decode_sequence(&key)?,
            None => 0,
        };

        Ok(Self {
            db,
            records,
            sequence,
            metadata,
            last_sequence: Mutex::new(last_sequence),
        })
    }

    /// Insert a record unless its hash is already present.
    ///
    /// The record and its sequence entry commit in one transaction. Returns
    /// the assigned marker, or `None` if the hash was already stored.
    pub fn insert_record(&self, record: &Record) -> Result<Option<Marker>, StorageError> {
        let key = record.content_hash.0;
        let value = postcard::to_allocvec(record)?;

        let mut last = self.last_sequence.lock();
        let next = *last + 1;

        let result: Result<bool, TransactionError<()>> =
            (&self.records, &self.sequence).transaction(|(records, sequence)| {
                if records.get(&key[..])?.is_some() {
                    return Ok(false);
                }
                records.insert(&key[..], value.as_slice())?;
                sequence.insert(&next.to_be_bytes()[..], &key[..])?;
                Ok::<_, ConflictableTransactionError<()>>(true)
            });

        match result {
            Ok(true) => {
                *last = next;
                Ok(Some(Marker(next)))
            }
            Ok(false) => Ok(None),
            Err(TransactionError::Storage(e)) => Err(StorageError::Sled(e)),
            Err(TransactionError::Abort(())) => {
                Err(StorageError::Corrupt("record insert aborted".into()))
            }
        }
    }

    /// Get a record by hash
    pub fn get_record(&self, hash: &ContentHash) -> Result<Option<Record>, StorageError> {
        match self.records.get(hash.0)? {
            Some(bytes) => {
                let record: Record = postcard::from_bytes(&bytes)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Check if a record exists
    pub fn has_record(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        Ok(self.records.contains_key(hash.0)?)
    }

    /// List hashes inserted after `marker`, oldest first, at most `limit`.
    pub fn list_since(&self, marker: Marker, limit: usize) -> Result<InventorySlice, StorageError> {
        let start = marker.0.saturating_add(1).to_be_bytes();
        let mut slice = InventorySlice {
            hashes: Vec::new(),
            marker,
        };

        for entry in self.sequence.range(start..).take(limit) {
            let (key, value) = entry?;
            slice.marker = Marker(decode_sequence(&key)?);
            slice.hashes.push(decode_hash(&value)?);
        }

        Ok(slice)
    }

    /// Marker of the most recent insert
    pub fn current_marker(&self) -> Marker {
        Marker(*self.last_sequence.lock())
    }

    /// Count records
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
