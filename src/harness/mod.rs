//! Harness capabilities
//!
//! The pluggable edges of the engine: splitting a suite into work items,
//! executing one work item, and reacting to a finished run.

mod command;
mod listener;

pub use command::{CatalogDecomposer, CommandExecutor};
pub use listener::{CompoundListener, LogListener, WebhookListener};

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{ExecutionResult, RunId, WorkItemSpec};

/// Everything an executor needs to run one work item
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub work_item_id: String,
    pub sub_case_count: u32,

    /// Isolation scope unique to this (run, work item) pair
    pub namespace: String,

    /// Point after which the executor should stop and report over-time
    pub deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, spec: &WorkItemSpec) -> Self {
        Self {
            run_id,
            work_item_id: spec.id.clone(),
            sub_case_count: spec.sub_case_count,
            namespace: format!("run-{}-{}", run_id, spec.id),
            deadline: None,
        }
    }

    /// Set the deadline to `budget` from now
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// Runs the sub-cases of one work item
#[async_trait]
pub trait TestExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Execute every sub-case of the work item
    ///
    /// An `Err` means the harness itself broke, not that a test failed.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult>;
}

/// Splits a suite into work items
#[async_trait]
pub trait SuiteDecomposer: Send + Sync {
    /// Tag recorded on runs this decomposer created
    fn name(&self) -> &str;

    fn available_suite_ids(&self) -> Vec<String>;

    async fn decompose(&self, suite_id: &str) -> Result<Vec<WorkItemSpec>>;
}

/// Notified once when a run finishes
#[async_trait]
pub trait RunListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_run_completion(&self, status_url: &str, run_id: RunId) -> Result<()>;
}

/// Absolute URL of a run's status page
pub fn build_run_status_url(server_url: &str, run_id: RunId) -> String {
    format!("{}/runs/{}", server_url.trim_end_matches('/'), run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_unique_per_item() {
        let a = ExecutionContext::new(1, &WorkItemSpec::new("a", 1));
        let b = ExecutionContext::new(1, &WorkItemSpec::new("b", 1));
        let c = ExecutionContext::new(2, &WorkItemSpec::new("a", 1));
        assert_eq!(a.namespace, "run-1-a");
        assert_ne!(a.namespace, b.namespace);
        assert_ne!(a.namespace, c.namespace);
        assert!(a.remaining().is_none());
        assert!(!a.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = ExecutionContext::new(1, &WorkItemSpec::new("a", 1))
            .with_deadline(Duration::from_secs(5));
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(ctx.is_expired());
    }

    #[test]
    fn test_build_run_status_url() {
        assert_eq!(
            build_run_status_url("http://ci.local/", 12),
            "http://ci.local/runs/12"
        );
        assert_eq!(
            build_run_status_url("http://ci.local", 12),
            "http://ci.local/runs/12"
        );
    }
}
