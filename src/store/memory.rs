//! In-memory store
//!
//! A [`Store`] held in a single mutex-guarded map, with JSON snapshots so
//! separate CLI invocations can inspect earlier runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

use super::{Precondition, Store, StoreError, Versioned, WriteBatch};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    value: Value,
    version: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    sequences: BTreeMap<String, i64>,
    #[serde(default)]
    entries: BTreeMap<String, Entry>,
}

/// Mutex-guarded in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot, or start empty if the file does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open snapshot: {}", path.display()))?;
        let state: State = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

        debug!(
            "Loaded {} entries from {}",
            state.entries.len(),
            path.display()
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Write the whole store to a snapshot file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let state = self.lock()?.clone();
        let file = File::create(path)
            .with_context(|| format!("Failed to create snapshot: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &state)
            .context("Failed to write snapshot")?;

        info!(
            "Saved {} entries to {}",
            state.entries.len(),
            path.display()
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let state = self.lock()?;
        Ok(state.entries.get(key).map(|entry| Versioned {
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Versioned {
                        value: entry.value.clone(),
                        version: entry.version,
                    },
                )
            })
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;

        // Check every precondition before touching anything
        for write in batch.writes() {
            let current = state.entries.get(&write.key).map(|entry| entry.version);
            let holds = match (write.precondition, current) {
                (None, _) => true,
                (Some(Precondition::Absent), current) => current.is_none(),
                (Some(Precondition::Version(expected)), Some(version)) => expected == version,
                (Some(Precondition::Version(_)), None) => false,
            };
            if !holds {
                return Err(StoreError::Conflict(write.key.clone()));
            }
        }

        trace!("Committing {} writes", batch.len());
        for write in batch.into_writes() {
            let version = state
                .entries
                .get(&write.key)
                .map(|entry| entry.version + 1)
                .unwrap_or(1);
            state.entries.insert(
                write.key,
                Entry {
                    value: write.value,
                    version,
                },
            );
        }
        Ok(())
    }

    async fn allocate_id(&self, sequence: &str) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        let next = state.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryStore::new();
        assert_ok!(
            store
                .commit(WriteBatch::new().create("k", json!(1)))
                .await
        );

        let err = store
            .commit(WriteBatch::new().create("k", json!(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(key) if key == "k"));

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!(1));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put("k", json!("a")))
            .await
            .unwrap();

        assert_ok!(
            store
                .commit(WriteBatch::new().replace("k", 1, json!("b")))
                .await
        );
        // stale version
        assert_err!(
            store
                .commit(WriteBatch::new().replace("k", 1, json!("c")))
                .await
        );
        // missing key
        assert_err!(
            store
                .commit(WriteBatch::new().replace("missing", 1, json!("c")))
                .await
        );

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!("b"));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let store = MemoryStore::new();
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_ok!(store.commit(batch).await);
        assert!(store.is_empty());

        let batch = WriteBatch::new().put("a", json!(1)).create("b", json!(2));
        assert_eq!(batch.len(), 2);
        assert_ok!(store.commit(batch).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().create("taken", json!(0)))
            .await
            .unwrap();

        let batch = WriteBatch::new()
            .put("a", json!(1))
            .create("taken", json!(2));
        assert_err!(store.commit(batch).await);

        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = MemoryStore::new();
        let batch = WriteBatch::new()
            .put("item/1/a", json!(1))
            .put("item/1/b", json!(2))
            .put("item/12/a", json!(3))
            .put("item/2/a", json!(4));
        store.commit(batch).await.unwrap();

        let keys: Vec<String> = store
            .scan_prefix("item/1/")
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["item/1/a", "item/1/b"]);
    }

    #[tokio::test]
    async fn test_allocate_id() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_id("run").await.unwrap(), 1);
        assert_eq!(store.allocate_id("run").await.unwrap(), 2);
        assert_eq!(store.allocate_id("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_save_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("store.json");

        let store = MemoryStore::new();
        store.allocate_id("run").await.unwrap();
        store
            .commit(WriteBatch::new().put("run/1", json!({"id": 1})))
            .await
            .unwrap();
        store.save(&path).unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.allocate_id("run").await.unwrap(), 2);
    }

    #[test]
    fn test_open_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("nope.json")).unwrap();
        assert!(store.is_empty());
    }
}
