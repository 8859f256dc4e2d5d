//! Domain models for suite runs
//!
//! Runs, work items, failures, and the summaries derived from them.

mod run;
mod summary;
mod work_item;

pub use run::{NewRunResult, Run, RunId, WorkItemSpec};
pub use summary::{CompletionState, RunSummary};
#[cfg(test)]
pub use work_item::HARNESS_ERROR_ID;
pub use work_item::{ExecutionResult, Failure, WorkItem, WorkItemStatus};
