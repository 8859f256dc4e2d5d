//! Persistence gateway
//!
//! Domain-level operations over the abstract [`Store`]. Work-item creation
//! and completion marking are create-if-absent transactions; terminal
//! work-item writes are compare-and-swap on the version just read.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::records::{
    completion_key, failure_key, run_key, work_item_counts_key, work_item_key, work_item_prefix,
    FailureRecord, RunRecord, WorkItemRecord, RUN_SEQUENCE,
};
use crate::models::{Failure, Run, RunId, WorkItem, WorkItemSpec, WorkItemStatus};
use crate::store::{Store, StoreError, WriteBatch};

/// Default bound for the indexed prefix of long failure text
pub const DEFAULT_MAX_TEXT_LEN: usize = 500;

/// Retries of a compare-and-swap write before giving up
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Outcome of a create-if-absent work-item write
#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    /// First delivery: the record was created in progress
    Created(WorkItem),
    /// A record already existed; it is returned untouched
    Existing(WorkItem),
}

/// Outcome of a terminal work-item write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    Recorded,
    /// Another writer got there first; nothing was written
    AlreadyTerminal(WorkItemStatus),
}

/// Data-access layer between the coordinator and the store
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn Store>,
    max_text_len: usize,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }

    /// Set the bound for the indexed prefix of failure text
    pub fn with_max_text_len(mut self, max_text_len: usize) -> Self {
        self.max_text_len = max_text_len;
        self
    }

    /// Create a run with an id allocated by the store and unknown totals
    pub async fn new_run(&self, decomposer_tag: &str) -> Result<Run, StoreError> {
        let id = self.store.allocate_id(RUN_SEQUENCE).await?;
        let run = Run::new(id, decomposer_tag, Utc::now());

        let batch = WriteBatch::new().create(run_key(id), encode(&RunRecord::from_run(&run))?);
        self.store.commit(batch).await?;

        debug!("Created run record {}", id);
        Ok(run)
    }

    /// Persist the totals of a run; every other field keeps its stored value
    pub async fn update_run_totals(&self, run: &Run) -> Result<(), StoreError> {
        let key = run_key(run.id);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let mut record: RunRecord = decode(current.value)?;
            record.num_tests = run.num_tests;
            record.num_test_entities = run.num_test_entities;

            let batch = WriteBatch::new().replace(&key, current.version, encode(&record)?);
            match self.store.commit(batch).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(key))
    }

    /// Load a run, optionally with its work-item count mapping
    pub async fn get_run(&self, run_id: RunId, load_counts: bool) -> Result<Option<Run>, StoreError> {
        let Some(stored) = self.store.get(&run_key(run_id)).await? else {
            return Ok(None);
        };
        let record: RunRecord = decode(stored.value)?;

        let counts = if load_counts {
            self.get_work_item_counts(run_id).await?
        } else {
            None
        };
        Ok(Some(record.into_run(counts)))
    }

    pub async fn add_work_item_counts(
        &self,
        run_id: RunId,
        counts: &BTreeMap<String, u32>,
    ) -> Result<(), StoreError> {
        let batch = WriteBatch::new().put(work_item_counts_key(run_id), encode(counts)?);
        self.store.commit(batch).await
    }

    /// The count mapping, or `None` if it has not been written yet
    async fn get_work_item_counts(
        &self,
        run_id: RunId,
    ) -> Result<Option<BTreeMap<String, u32>>, StoreError> {
        match self.store.get(&work_item_counts_key(run_id)).await? {
            Some(stored) => Ok(Some(decode(stored.value)?)),
            None => Ok(None),
        }
    }

    /// Create the in-progress record for a work item unless one exists
    pub async fn create_work_item(
        &self,
        run_id: RunId,
        spec: &WorkItemSpec,
    ) -> Result<CreateOutcome, StoreError> {
        let key = work_item_key(run_id, &spec.id);
        let item = WorkItem::start(run_id, spec);
        let batch = WriteBatch::new().create(&key, encode(&WorkItemRecord::from_work_item(&item))?);

        match self.store.commit(batch).await {
            Ok(()) => Ok(CreateOutcome::Created(item)),
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .get_work_item(run_id, &spec.id)
                    .await?
                    .ok_or(StoreError::NotFound(key))?;
                Ok(CreateOutcome::Existing(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// Write a terminal work item together with its new failures
    ///
    /// Refuses to overwrite a record that is already terminal. Any other
    /// move the work item state machine forbids is an error.
    pub async fn finish_work_item(
        &self,
        item: &WorkItem,
        new_failures: &[Failure],
    ) -> Result<FinishOutcome, StoreError> {
        let key = work_item_key(item.run_id, &item.id);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let stored: WorkItemRecord = decode(current.value)?;
            if !stored.status.can_transition_to(item.status) {
                if stored.status.is_terminal() {
                    warn!(
                        "Work item {} in run {} is already {}, dropping {} result",
                        item.id, item.run_id, stored.status, item.status
                    );
                    return Ok(FinishOutcome::AlreadyTerminal(stored.status));
                }
                return Err(StoreError::InvalidState {
                    key,
                    from: stored.status.to_string(),
                    to: item.status.to_string(),
                });
            }

            let mut batch = WriteBatch::new();
            for failure in new_failures {
                let record = FailureRecord::new(item.run_id, &item.id, failure, self.max_text_len);
                batch = batch.put(
                    failure_key(item.run_id, &item.id, &failure.id),
                    encode(&record)?,
                );
            }
            batch = batch.replace(
                &key,
                current.version,
                encode(&WorkItemRecord::from_work_item(item))?,
            );

            match self.store.commit(batch).await {
                Ok(()) => return Ok(FinishOutcome::Recorded),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(key))
    }

    /// Every work item record of a run
    pub async fn work_items_for_run(&self, run_id: RunId) -> Result<Vec<WorkItem>, StoreError> {
        self.store
            .scan_prefix(&work_item_prefix(run_id))
            .await?
            .into_iter()
            .map(|(_, stored)| decode::<WorkItemRecord>(stored.value).map(|r| r.into_work_item()))
            .collect()
    }

    pub async fn get_work_item(
        &self,
        run_id: RunId,
        work_item_id: &str,
    ) -> Result<Option<WorkItem>, StoreError> {
        match self.store.get(&work_item_key(run_id, work_item_id)).await? {
            Some(stored) => Ok(Some(
                decode::<WorkItemRecord>(stored.value)?.into_work_item(),
            )),
            None => Ok(None),
        }
    }

    pub async fn get_failure(
        &self,
        run_id: RunId,
        work_item_id: &str,
        failure_id: &str,
    ) -> Result<Option<Failure>, StoreError> {
        let key = failure_key(run_id, work_item_id, failure_id);
        match self.store.get(&key).await? {
            Some(stored) => Ok(Some(decode::<FailureRecord>(stored.value)?.into_failure())),
            None => Ok(None),
        }
    }

    /// Create the completion marker of a run
    ///
    /// Returns `true` only for the single caller whose create committed.
    pub async fn create_completion_record(&self, run_id: RunId) -> Result<bool, StoreError> {
        let batch = WriteBatch::new().create(completion_key(run_id), Value::Null);
        match self.store.commit(batch).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionResult;
    use crate::store::MemoryStore;
    use futures::future::join_all;

    fn gateway() -> PersistenceGateway {
        PersistenceGateway::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_new_run_and_totals() {
        let gateway = gateway();
        let mut run = gateway.new_run("command").await.unwrap();
        assert_eq!(run.id, 1);
        assert!(run.num_tests.is_none());

        let counts = BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 3)]);
        run.set_totals(&counts);
        run.decomposer_tag = "changed".to_string();
        gateway.update_run_totals(&run).await.unwrap();

        let loaded = gateway.get_run(run.id, false).await.unwrap().unwrap();
        assert_eq!(loaded.num_tests, Some(5));
        assert_eq!(loaded.num_test_entities, Some(2));
        // only totals are mutable
        assert_eq!(loaded.decomposer_tag, "command");
        assert!(loaded.work_item_counts.is_none());
    }

    #[tokio::test]
    async fn test_work_item_counts_are_optional() {
        let gateway = gateway();
        let run = gateway.new_run("command").await.unwrap();

        let loaded = gateway.get_run(run.id, true).await.unwrap().unwrap();
        assert!(loaded.work_item_counts.is_none());

        let counts = BTreeMap::from([("a".to_string(), 1)]);
        gateway.add_work_item_counts(run.id, &counts).await.unwrap();
        let loaded = gateway.get_run(run.id, true).await.unwrap().unwrap();
        assert_eq!(loaded.work_item_counts, Some(counts));
    }

    #[tokio::test]
    async fn test_missing_run() {
        let gateway = gateway();
        assert!(gateway.get_run(42, true).await.unwrap().is_none());

        let run = Run::new(42, "x", Utc::now());
        assert!(matches!(
            gateway.update_run_totals(&run).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_work_item_is_idempotent() {
        let gateway = gateway();
        let spec = WorkItemSpec::new("a", 2);

        let first = gateway.create_work_item(1, &spec).await.unwrap();
        let CreateOutcome::Created(created) = first else {
            panic!("expected first create to succeed");
        };

        let second = gateway.create_work_item(1, &spec).await.unwrap();
        assert_eq!(second, CreateOutcome::Existing(created));
        assert_eq!(gateway.work_items_for_run(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create_work_item() {
        let gateway = gateway();
        let spec = WorkItemSpec::new("a", 1);

        let outcomes = join_all((0..16).map(|_| gateway.create_work_item(1, &spec))).await;
        let created = outcomes
            .into_iter()
            .filter(|o| matches!(o, Ok(CreateOutcome::Created(_))))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_finish_work_item_persists_failures() {
        let gateway = gateway().with_max_text_len(8);
        let CreateOutcome::Created(mut item) = gateway
            .create_work_item(1, &WorkItemSpec::new("a", 2))
            .await
            .unwrap()
        else {
            panic!("expected create");
        };

        let result = ExecutionResult::new()
            .with_success("one")
            .with_failure(Failure::new("two", "a very long message", "trace"));
        let new_failures = item.apply_result(result);
        item.finish(Utc::now());

        let outcome = gateway.finish_work_item(&item, &new_failures).await.unwrap();
        assert_eq!(outcome, FinishOutcome::Recorded);

        let stored = gateway.get_work_item(1, "a").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Failure);
        assert!(stored.end_time.is_some());

        let failure = gateway.get_failure(1, "a", "two").await.unwrap().unwrap();
        assert_eq!(failure.message, "a very long message");
        assert!(gateway.get_failure(1, "a", "one").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_overwritten() {
        let gateway = gateway();
        let CreateOutcome::Created(item) = gateway
            .create_work_item(1, &WorkItemSpec::new("a", 1))
            .await
            .unwrap()
        else {
            panic!("expected create");
        };

        let mut interrupted = item.clone();
        interrupted.interrupt();
        assert_eq!(
            gateway.finish_work_item(&interrupted, &[]).await.unwrap(),
            FinishOutcome::Recorded
        );

        let mut late = item;
        late.apply_result(ExecutionResult::new().with_success("x"));
        assert_eq!(
            gateway.finish_work_item(&late, &[]).await.unwrap(),
            FinishOutcome::AlreadyTerminal(WorkItemStatus::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_finish_requires_terminal_status() {
        let gateway = gateway();
        let CreateOutcome::Created(item) = gateway
            .create_work_item(1, &WorkItemSpec::new("a", 1))
            .await
            .unwrap()
        else {
            panic!("expected create");
        };

        let err = gateway.finish_work_item(&item, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
        let stored = gateway.get_work_item(1, "a").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::InProgress);
    }

    #[tokio::test]
    async fn test_failures_with_slashes_in_ids_stay_apart() {
        let gateway = gateway();
        for (work_item_id, failure_id, message) in
            [("a/b", "c", "from a/b"), ("a", "b/c", "from a")]
        {
            let CreateOutcome::Created(mut item) = gateway
                .create_work_item(1, &WorkItemSpec::new(work_item_id, 1))
                .await
                .unwrap()
            else {
                panic!("expected create");
            };
            let new_failures = item.apply_result(
                ExecutionResult::new().with_failure(Failure::new(failure_id, message, "")),
            );
            item.finish(Utc::now());
            assert_eq!(
                gateway.finish_work_item(&item, &new_failures).await.unwrap(),
                FinishOutcome::Recorded
            );
        }

        let first = gateway.get_failure(1, "a/b", "c").await.unwrap().unwrap();
        assert_eq!(first.message, "from a/b");
        let second = gateway.get_failure(1, "a", "b/c").await.unwrap().unwrap();
        assert_eq!(second.message, "from a");

        let mut ids: Vec<String> = gateway
            .work_items_for_run(1)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "a/b"]);
    }

    #[tokio::test]
    async fn test_work_items_scoped_to_run() {
        let gateway = gateway();
        gateway
            .create_work_item(1, &WorkItemSpec::new("a", 1))
            .await
            .unwrap();
        gateway
            .create_work_item(11, &WorkItemSpec::new("a", 1))
            .await
            .unwrap();

        assert_eq!(gateway.work_items_for_run(1).await.unwrap().len(), 1);
        assert_eq!(gateway.work_items_for_run(11).await.unwrap().len(), 1);
        assert!(gateway.work_items_for_run(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_record_created_once() {
        let gateway = gateway();
        let outcomes = join_all((0..16).map(|_| gateway.create_completion_record(7))).await;
        let winners = outcomes.into_iter().filter(|o| matches!(o, Ok(true))).count();
        assert_eq!(winners, 1);
        assert!(!gateway.create_completion_record(7).await.unwrap());
    }
}
