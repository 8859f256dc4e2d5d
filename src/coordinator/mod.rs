//! Run coordination
//!
//! Creates runs, executes delivered work items idempotently, and detects run
//! completion exactly once.

mod manager;

pub use manager::RunCoordinator;

use std::time::Duration;
use thiserror::Error;

use crate::config::AppConfig;
use crate::dispatch::{DEFAULT_FAN_IN_WINDOW, DEFAULT_MAX_BATCH_SIZE};
use crate::models::{RunId, WorkItemStatus};
use crate::persistence::DEFAULT_MAX_TEXT_LEN;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Message of the result returned when run creation runs out of time
pub const CREATE_RUN_DEADLINE_MESSAGE: &str = "Unable to create run due to deadline exceeded";

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The decomposer produced two work items with the same id
    #[error("Duplicate work item id: {0}")]
    DuplicateWorkItem(String),

    #[error("Failed to decompose suite {suite_id}")]
    Decomposer {
        suite_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// At least one listener failed; every listener was still invoked
    #[error("Completion notification for run {run_id} failed")]
    Notification {
        run_id: RunId,
        #[source]
        source: anyhow::Error,
    },
}

/// What a delivery of a work item did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// First delivery: the executor ran and the result was recorded
    Executed(WorkItemStatus),
    /// A later delivery found the record in progress and closed it
    Interrupted,
    /// The record was already terminal; nothing changed
    Duplicate(WorkItemStatus),
}

/// What a completion check found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    RunNotFound,
    /// Some work item is still in progress
    InProgress,
    /// Some work items have not recorded a start yet
    Pending,
    /// This check created the completion record and notified the listeners
    Notified,
    /// Another check already created the completion record
    AlreadyNotified,
}

/// Coordinator settings
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorSettings {
    /// Time budget for `create_new_run`
    pub create_run_budget: Duration,

    /// Deadline handed to the executor for each work item
    pub work_item_deadline: Option<Duration>,

    /// Base of run status URLs
    pub server_url: String,

    pub max_batch_size: usize,
    pub fan_in_window: Duration,
    pub max_text_len: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            create_run_budget: Duration::from_secs(60),
            work_item_deadline: None,
            server_url: "http://localhost:8080".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            fan_in_window: DEFAULT_FAN_IN_WINDOW,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let settings = Self {
            server_url: config.server_url.clone(),
            max_batch_size: config.dispatch.max_batch_size,
            fan_in_window: config.dispatch.fan_in_window(),
            max_text_len: config.storage.max_indexed_text_len,
            ..Default::default()
        }
        .with_create_run_budget(config.execution.create_run_budget());

        match config.execution.work_item_deadline() {
            Some(deadline) => settings.with_work_item_deadline(deadline),
            None => settings,
        }
    }

    pub fn with_create_run_budget(mut self, budget: Duration) -> Self {
        self.create_run_budget = budget;
        self
    }

    pub fn with_work_item_deadline(mut self, deadline: Duration) -> Self {
        self.work_item_deadline = Some(deadline);
        self
    }

    pub fn with_fan_in_window(mut self, window: Duration) -> Self {
        self.fan_in_window = window;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::default().with_server_url("http://ci");
        config.dispatch.fan_in_window_ms = 250;
        config.execution.work_item_deadline_secs = None;

        let settings = CoordinatorSettings::from_config(&config);
        assert_eq!(settings.fan_in_window, Duration::from_millis(250));
        assert_eq!(settings.work_item_deadline, None);
        assert_eq!(settings.server_url, "http://ci");
        assert_eq!(settings.max_batch_size, 100);
    }

    #[test]
    fn test_error_messages() {
        let err = CoordinatorError::DuplicateWorkItem("a".to_string());
        assert_eq!(err.to_string(), "Duplicate work item id: a");

        let err = CoordinatorError::from(StoreError::NotFound("run/1".to_string()));
        assert_eq!(err.to_string(), "Key not found: run/1");
    }
}
