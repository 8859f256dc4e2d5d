//! Work queue
//!
//! Tasks carried between the coordinator's endpoints, and the at-least-once
//! queue abstraction that delivers them. A task may be delivered more than
//! once and in any order; handlers must tolerate both.

mod local;

pub use local::{LocalQueue, LocalQueueSettings};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::{RunId, WorkItemSpec};

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// A task with this name was already accepted; the add is a no-op
    #[error("Task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("Batch of {size} tasks exceeds the queue limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// A unit of deferred work
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Task {
    /// Run one work item through the executor
    ExecuteWorkItem {
        run_id: RunId,
        work_item_id: String,
        sub_case_count: u32,
    },

    /// Check whether a run has finished and notify if so
    CompletionCheck { run_id: RunId },

    /// Persist the work-item count mapping of a run
    StoreWorkItemCounts {
        run_id: RunId,
        counts: BTreeMap<String, u32>,
    },
}

impl Task {
    pub fn execute(run_id: RunId, spec: &WorkItemSpec) -> Self {
        Task::ExecuteWorkItem {
            run_id,
            work_item_id: spec.id.clone(),
            sub_case_count: spec.sub_case_count,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::ExecuteWorkItem {
                run_id,
                work_item_id,
                ..
            } => write!(f, "execute {work_item_id} (run {run_id})"),
            Task::CompletionCheck { run_id } => write!(f, "completion check (run {run_id})"),
            Task::StoreWorkItemCounts { run_id, counts } => {
                write!(f, "store {} work item counts (run {run_id})", counts.len())
            }
        }
    }
}

/// Delivery options of a task
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Deduplication name; a second add under the same name is rejected
    pub name: Option<String>,

    /// Delay before the task becomes eligible for delivery
    pub countdown: Duration,
}

/// A task together with its delivery options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRequest {
    pub task: Task,
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            options: TaskOptions::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.options.countdown = countdown;
        self
    }
}

/// Abstract at-least-once task queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a single task
    async fn add(&self, request: TaskRequest) -> Result<(), QueueError>;

    /// Enqueue at most [`WorkQueue::max_batch_size`] tasks in one call
    async fn add_batch(&self, requests: Vec<TaskRequest>) -> Result<(), QueueError>;

    /// Largest batch `add_batch` accepts
    fn max_batch_size(&self) -> usize;
}

/// Receiver of delivered tasks
///
/// An `Err` (or a panic) makes the queue redeliver the task later.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<()>;
}
