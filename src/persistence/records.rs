//! Persisted record shapes
//!
//! The store-side layout of runs, work items, failures, and completion
//! markers, plus the key scheme that places them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use urlencoding::encode;

use crate::models::{Failure, Run, RunId, WorkItem, WorkItemStatus};

pub(crate) const RUN_SEQUENCE: &str = "run";

pub(crate) fn run_key(run_id: RunId) -> String {
    format!("run/{run_id}")
}

pub(crate) fn work_item_counts_key(run_id: RunId) -> String {
    format!("counts/{run_id}")
}

/// Prefix shared by every work item of a run
pub(crate) fn work_item_prefix(run_id: RunId) -> String {
    format!("item/{run_id}/")
}

/// Ids are percent-encoded so no id can contain the `/` separator
pub(crate) fn work_item_key(run_id: RunId, work_item_id: &str) -> String {
    format!("{}{}", work_item_prefix(run_id), encode(work_item_id))
}

pub(crate) fn failure_key(run_id: RunId, work_item_id: &str, failure_id: &str) -> String {
    format!(
        "failure/{run_id}/{}/{}",
        encode(work_item_id),
        encode(failure_id)
    )
}

pub(crate) fn completion_key(run_id: RunId) -> String {
    format!("completion/{run_id}")
}

/// Run record; only the totals change after creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub decomposer_tag: String,
    pub created: DateTime<Utc>,
    pub num_tests: Option<u64>,
    pub num_test_entities: Option<u64>,
}

impl RunRecord {
    pub fn from_run(run: &Run) -> Self {
        Self {
            id: run.id,
            decomposer_tag: run.decomposer_tag.clone(),
            created: run.created,
            num_tests: run.num_tests,
            num_test_entities: run.num_test_entities,
        }
    }

    pub fn into_run(self, work_item_counts: Option<BTreeMap<String, u32>>) -> Run {
        Run {
            id: self.id,
            decomposer_tag: self.decomposer_tag,
            created: self.created,
            num_tests: self.num_tests,
            num_test_entities: self.num_test_entities,
            work_item_counts,
        }
    }
}

/// Work item record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItemRecord {
    pub run_id: RunId,
    pub work_item_id: String,
    pub sub_case_count: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub success_names: Vec<String>,
    #[serde(default)]
    pub failure_ids: Vec<String>,
}

impl WorkItemRecord {
    pub fn from_work_item(item: &WorkItem) -> Self {
        Self {
            run_id: item.run_id,
            work_item_id: item.id.clone(),
            sub_case_count: item.sub_case_count,
            start_time: item.start_time,
            end_time: item.end_time,
            duration_ms: item.duration_ms(),
            status: item.status,
            success_names: item.successes.iter().cloned().collect(),
            failure_ids: item.failure_ids.iter().cloned().collect(),
        }
    }

    pub fn into_work_item(self) -> WorkItem {
        WorkItem {
            run_id: self.run_id,
            id: self.work_item_id,
            sub_case_count: self.sub_case_count,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            successes: self.success_names.into_iter().collect(),
            failure_ids: self.failure_ids.into_iter().collect(),
        }
    }
}

/// Failure record
///
/// Long text is kept as a bounded prefix plus, only when truncated, the full
/// copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: RunId,
    pub work_item_id: String,
    pub failure_id: String,
    pub message_short: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_full: Option<String>,
    pub diagnostic_short: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_full: Option<String>,
}

impl FailureRecord {
    pub fn new(run_id: RunId, work_item_id: &str, failure: &Failure, max_len: usize) -> Self {
        let (message_short, message_full) = split_text(&failure.message, max_len);
        let (diagnostic_short, diagnostic_full) = split_text(&failure.diagnostic, max_len);
        Self {
            run_id,
            work_item_id: work_item_id.to_string(),
            failure_id: failure.id.clone(),
            message_short,
            message_full,
            diagnostic_short,
            diagnostic_full,
        }
    }

    pub fn into_failure(self) -> Failure {
        Failure {
            id: self.failure_id,
            message: self.message_full.unwrap_or(self.message_short),
            diagnostic: self.diagnostic_full.unwrap_or(self.diagnostic_short),
        }
    }
}

/// Split text into a prefix of at most `max_len` chars and the full text if
/// anything was cut
fn split_text(text: &str, max_len: usize) -> (String, Option<String>) {
    match text.char_indices().nth(max_len) {
        Some((cut, _)) => (text[..cut].to_string(), Some(text.to_string())),
        None => (text.to_string(), None),
    }
}
