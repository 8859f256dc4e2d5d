//! Work item models
//!
//! Defines work-item status, failures, and executor results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::run::{RunId, WorkItemSpec};

/// Failure id used for failures synthesized by the harness itself
pub const HARNESS_ERROR_ID: &str = "Harness Error";

/// Work item status
///
/// `NotStarted` is never persisted: absence of a record means not started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    NotStarted,
    InProgress,
    Success,
    Failure,
    TooSlow,
    /// A later delivery found the record still in progress, so the attempt
    /// that created it never recorded a result.
    Interrupted,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Success
                | WorkItemStatus::Failure
                | WorkItemStatus::TooSlow
                | WorkItemStatus::Interrupted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        match self {
            WorkItemStatus::NotStarted => next == WorkItemStatus::InProgress,
            WorkItemStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            WorkItemStatus::NotStarted => "·",
            WorkItemStatus::InProgress => "…",
            WorkItemStatus::Success => "✓",
            WorkItemStatus::Failure => "✗",
            WorkItemStatus::TooSlow => "⌛",
            WorkItemStatus::Interrupted => "!",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemStatus::NotStarted => write!(f, "NOT_STARTED"),
            WorkItemStatus::InProgress => write!(f, "IN_PROGRESS"),
            WorkItemStatus::Success => write!(f, "SUCCESS"),
            WorkItemStatus::Failure => write!(f, "FAILURE"),
            WorkItemStatus::TooSlow => write!(f, "TOO_SLOW"),
            WorkItemStatus::Interrupted => write!(f, "INTERRUPTED"),
        }
    }
}

/// One failed sub-case of a work item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Sub-case id, unique within the owning work item
    pub id: String,

    /// Human-readable message
    pub message: String,

    /// Verbose diagnostic payload (trace, captured output)
    pub diagnostic: String,
}

impl Failure {
    pub fn new(
        id: impl Into<String>,
        message: impl Into<String>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Result reported by a test executor for one work item
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Names of the sub-cases that passed
    pub successes: BTreeSet<String>,

    /// Sub-cases that failed
    pub failures: Vec<Failure>,

    /// The executor ran out of time before finishing every sub-case
    pub deadline_exceeded: bool,
}

impl ExecutionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_success(mut self, name: impl Into<String>) -> Self {
        self.successes.insert(name.into());
        self
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failures.push(failure);
        self
    }

    pub fn too_slow(mut self) -> Self {
        self.deadline_exceeded = true;
        self
    }

    /// Result used when the executor itself errored
    pub fn harness_error(message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::new().with_failure(Failure::new(HARNESS_ERROR_ID, message, diagnostic))
    }

    /// Terminal status implied by this result
    ///
    /// Over-time wins over partial outcomes; any failure forces FAILURE.
    pub fn terminal_status(&self) -> WorkItemStatus {
        if self.deadline_exceeded {
            WorkItemStatus::TooSlow
        } else if !self.failures.is_empty() {
            WorkItemStatus::Failure
        } else {
            WorkItemStatus::Success
        }
    }
}

/// A work item of a run, as persisted
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub run_id: RunId,
    pub id: String,
    pub sub_case_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: WorkItemStatus,
    pub successes: BTreeSet<String>,
    pub failure_ids: BTreeSet<String>,
}

impl WorkItem {
    /// A freshly started work item
    pub fn start(run_id: RunId, spec: &WorkItemSpec) -> Self {
        Self {
            run_id,
            id: spec.id.clone(),
            sub_case_count: spec.sub_case_count,
            start_time: Utc::now(),
            end_time: None,
            status: WorkItemStatus::InProgress,
            successes: BTreeSet::new(),
            failure_ids: BTreeSet::new(),
        }
    }

    pub fn num_failures(&self) -> usize {
        self.failure_ids.len()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    /// Fold an executor result into this item
    ///
    /// Returns the failures that are new to this item and need persisting.
    pub fn apply_result(&mut self, result: ExecutionResult) -> Vec<Failure> {
        self.status = result.terminal_status();
        self.successes.extend(result.successes);

        let mut new_failures = Vec::new();
        for failure in result.failures {
            if self.failure_ids.insert(failure.id.clone()) {
                new_failures.push(failure);
            }
        }
        new_failures
    }

    /// Mark terminal without a result from the executor
    pub fn interrupt(&mut self) {
        self.status = WorkItemStatus::Interrupted;
    }

    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {}/{} passed",
            self.status.symbol(),
            self.id,
            self.status,
            self.successes.len(),
            self.sub_case_count
        )?;
        if let Some(ms) = self.duration_ms() {
            write!(f, " in {ms}ms")?;
        }
        Ok(())
    }
}
