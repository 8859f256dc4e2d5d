//! Dispatch batching
//!
//! Fans a run's work items out onto the queue in bounded batches, and
//! collapses the many completion checks a finishing run triggers into one
//! named task per fan-in window.

use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{RunId, WorkItemSpec};
use crate::queue::{QueueError, Task, TaskRequest, WorkQueue};

/// Default number of tasks per enqueue call
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default fan-in window
pub const DEFAULT_FAN_IN_WINDOW: Duration = Duration::from_millis(1000);

/// Name of the completion check of `run_id` for the window containing `now_ms`
///
/// Every caller inside the same window derives the same name, so the queue
/// accepts only the first of them.
pub fn fan_in_key(run_id: RunId, now_ms: i64, window_ms: i64) -> String {
    format!("{}-{}", run_id, now_ms.div_euclid(window_ms.max(1)))
}

/// Batching front end of the work queue
#[derive(Clone)]
pub struct DispatchBatcher {
    queue: Arc<dyn WorkQueue>,
    max_batch_size: usize,
    fan_in_window: Duration,
}

impl DispatchBatcher {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            fan_in_window: DEFAULT_FAN_IN_WINDOW,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_fan_in_window(mut self, window: Duration) -> Self {
        self.fan_in_window = window;
        self
    }

    /// Effective batch size: the configured size capped by the queue's limit
    pub fn batch_size(&self) -> usize {
        self.max_batch_size.min(self.queue.max_batch_size()).max(1)
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.fan_in_window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Enqueue one execute task per work item
    ///
    /// Batches are submitted concurrently; returns the number of batches.
    pub async fn fan_out(&self, run_id: RunId, items: &[WorkItemSpec]) -> Result<usize, QueueError> {
        let batches: Vec<Vec<TaskRequest>> = items
            .chunks(self.batch_size())
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|spec| TaskRequest::new(Task::execute(run_id, spec)))
                    .collect()
            })
            .collect();
        let count = batches.len();

        try_join_all(batches.into_iter().map(|batch| self.queue.add_batch(batch))).await?;

        info!(
            "Enqueued {} work items for run {} in {} batches",
            items.len(),
            run_id,
            count
        );
        Ok(count)
    }

    /// Enqueue the fire-and-forget task that persists the count mapping
    pub async fn schedule_work_item_counts(
        &self,
        run_id: RunId,
        counts: BTreeMap<String, u32>,
    ) -> Result<(), QueueError> {
        self.queue
            .add(TaskRequest::new(Task::StoreWorkItemCounts { run_id, counts }))
            .await
    }

    /// Schedule the completion check of the current fan-in window
    pub async fn schedule_completion_check(&self, run_id: RunId) -> Result<bool, QueueError> {
        self.schedule_completion_check_at(run_id, Utc::now().timestamp_millis())
            .await
    }

    /// Schedule the completion check of the window containing `now_ms`
    ///
    /// The check runs after two windows so that every item finishing in this
    /// window is visible to it. Returns `false` when the window's check was
    /// already scheduled.
    pub async fn schedule_completion_check_at(
        &self,
        run_id: RunId,
        now_ms: i64,
    ) -> Result<bool, QueueError> {
        let name = fan_in_key(run_id, now_ms, self.window_ms());
        let request = TaskRequest::new(Task::CompletionCheck { run_id })
            .with_name(&name)
            .with_countdown(self.fan_in_window * 2);

        match self.queue.add(request).await {
            Ok(()) => {
                debug!("Scheduled completion check {}", name);
                Ok(true)
            }
            Err(QueueError::TaskAlreadyExists(_)) => {
                debug!("Completion check {} already scheduled", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingQueue;

    fn specs(n: usize) -> Vec<WorkItemSpec> {
        (0..n).map(|i| WorkItemSpec::new(format!("item-{i}"), 1)).collect()
    }

    #[test]
    fn test_fan_in_key() {
        assert_eq!(fan_in_key(23, 0, 1000), "23-0");
        assert_eq!(fan_in_key(23, 999, 1000), "23-0");
        assert_eq!(fan_in_key(23, 1000, 1000), "23-1");
        assert_eq!(fan_in_key(23, 1999, 1000), "23-1");
        assert_eq!(fan_in_key(23, 1_700_000_000_123, 1000), "23-1700000000");
    }

    #[tokio::test]
    async fn test_fan_out_batching() {
        for (n, expected) in [(0, 0), (99, 1), (100, 1), (101, 2), (250, 3)] {
            let queue = Arc::new(RecordingQueue::new());
            let batcher = DispatchBatcher::new(queue.clone());

            assert_eq!(batcher.fan_out(5, &specs(n)).await.unwrap(), expected);
            assert_eq!(queue.batches().len(), expected);
            assert_eq!(queue.tasks().len(), n);
            assert!(queue.batches().iter().all(|b| b.len() <= 100));
        }
    }

    #[tokio::test]
    async fn test_batch_size_capped_by_queue() {
        let queue = Arc::new(RecordingQueue::new().with_max_batch_size(10));
        let batcher = DispatchBatcher::new(queue.clone()).with_max_batch_size(50);
        assert_eq!(batcher.batch_size(), 10);
        assert_eq!(batcher.fan_out(1, &specs(25)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_completion_checks_collapse_within_window() {
        let queue = Arc::new(RecordingQueue::new());
        let batcher = DispatchBatcher::new(queue.clone());

        assert!(batcher.schedule_completion_check_at(7, 5_000).await.unwrap());
        assert!(!batcher.schedule_completion_check_at(7, 5_400).await.unwrap());
        assert!(!batcher.schedule_completion_check_at(7, 5_999).await.unwrap());
        // other runs are independent
        assert!(batcher.schedule_completion_check_at(8, 5_000).await.unwrap());

        let requests = queue.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].options.name.as_deref(), Some("7-5"));
        assert_eq!(requests[0].options.countdown, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_separate_windows_are_not_deduplicated() {
        let queue = Arc::new(RecordingQueue::new());
        let batcher =
            DispatchBatcher::new(queue.clone()).with_fan_in_window(Duration::from_millis(500));

        assert!(batcher.schedule_completion_check_at(7, 400).await.unwrap());
        assert!(batcher.schedule_completion_check_at(7, 600).await.unwrap());
        assert_eq!(queue.requests().len(), 2);
        assert_eq!(
            queue.requests()[1].options.countdown,
            Duration::from_millis(1000)
        );
    }

    #[tokio::test]
    async fn test_work_item_counts_task() {
        let queue = Arc::new(RecordingQueue::new());
        let batcher = DispatchBatcher::new(queue.clone());
        let counts = BTreeMap::from([("a".to_string(), 2)]);

        batcher
            .schedule_work_item_counts(3, counts.clone())
            .await
            .unwrap();
        assert_eq!(
            queue.tasks(),
            vec![Task::StoreWorkItemCounts { run_id: 3, counts }]
        );
    }
}
