//! Run models
//!
//! A run is one execution of a decomposed suite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Store-assigned run identifier
pub type RunId = i64;

/// One schedulable unit as produced by a suite decomposer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemSpec {
    /// Work-item id, unique within a run
    pub id: String,

    /// Number of sub-cases the item covers
    pub sub_case_count: u32,
}

impl WorkItemSpec {
    pub fn new(id: impl Into<String>, sub_case_count: u32) -> Self {
        Self {
            id: id.into(),
            sub_case_count,
        }
    }
}

impl fmt::Display for WorkItemSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// One execution of a suite
///
/// `num_tests` and `num_test_entities` stay `None` until decomposition has
/// finished and are fixed afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,

    /// Name of the decomposer that split the suite into work items
    pub decomposer_tag: String,

    pub created: DateTime<Utc>,

    /// Total sub-case count
    pub num_tests: Option<u64>,

    /// Total work-item count
    pub num_test_entities: Option<u64>,

    /// Work-item id to sub-case count, only attached on request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_counts: Option<BTreeMap<String, u32>>,
}

impl Run {
    pub fn new(id: RunId, decomposer_tag: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            id,
            decomposer_tag: decomposer_tag.into(),
            created,
            num_tests: None,
            num_test_entities: None,
            work_item_counts: None,
        }
    }

    /// Set both totals from a work-item count mapping
    pub fn set_totals(&mut self, counts: &BTreeMap<String, u32>) {
        self.num_tests = Some(counts.values().map(|&n| u64::from(n)).sum());
        self.num_test_entities = Some(counts.len() as u64);
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run {}", self.id)?;
        match (self.num_test_entities, self.num_tests) {
            (Some(items), Some(tests)) => write!(f, " ({items} work items, {tests} tests)"),
            _ => write!(f, " (decomposing)"),
        }
    }
}

/// Outcome of a run creation request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NewRunResult {
    Created {
        run: Run,
        work_item_counts: BTreeMap<String, u32>,
    },
    Failed {
        error: String,
    },
}

impl NewRunResult {
    pub fn created(run: Run, work_item_counts: BTreeMap<String, u32>) -> Self {
        NewRunResult::Created {
            run,
            work_item_counts,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        NewRunResult::Failed {
            error: error.into(),
        }
    }

    pub fn run(&self) -> Option<&Run> {
        match self {
            NewRunResult::Created { run, .. } => Some(run),
            NewRunResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            NewRunResult::Created { .. } => None,
            NewRunResult::Failed { error } => Some(error),
        }
    }
}
