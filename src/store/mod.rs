//! Transactional key-value store
//!
//! The narrow interface the persistence layer needs from a durable store:
//! point reads, prefix range scans, id allocation, and all-or-nothing write
//! batches whose writes may carry create-if-absent or compare-and-swap
//! preconditions.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// A precondition of a write batch did not hold; nothing was written
    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    /// A record cannot move to the requested state
    #[error("Invalid state change of {key}: {from} to {to}")]
    InvalidState { key: String, from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A stored value together with its version
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// Condition a write requires on the current state of its key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// Key must not exist
    Absent,
    /// Key must exist with exactly this version
    Version(u64),
}

/// A single write of a batch
#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub key: String,
    pub value: Value,
    pub precondition: Option<Precondition>,
}

/// Writes committed atomically
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional write
    pub fn put(mut self, key: impl Into<String>, value: Value) -> Self {
        self.writes.push(Write {
            key: key.into(),
            value,
            precondition: None,
        });
        self
    }

    /// Write that only succeeds if the key does not exist yet
    pub fn create(mut self, key: impl Into<String>, value: Value) -> Self {
        self.writes.push(Write {
            key: key.into(),
            value,
            precondition: Some(Precondition::Absent),
        });
        self
    }

    /// Write that only succeeds if the key is still at `version`
    pub fn replace(mut self, key: impl Into<String>, version: u64, value: Value) -> Self {
        self.writes.push(Write {
            key: key.into(),
            value,
            precondition: Some(Precondition::Version(version)),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// Abstract durable store
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;

    /// Commit every write of the batch or none of them
    ///
    /// Fails with [`StoreError::Conflict`] naming the first key whose
    /// precondition does not hold.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Next id of a named sequence, starting at 1
    async fn allocate_id(&self, sequence: &str) -> Result<i64, StoreError>;
}
