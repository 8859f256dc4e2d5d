//! Run summary models
//!
//! Read-time projections of a run's work items. Nothing here is persisted;
//! summaries are rebuilt from stored work items on every query.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::run::Run;
use super::work_item::{WorkItem, WorkItemStatus};

/// A run's work items partitioned by status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: Run,
    pub passed: Vec<WorkItem>,
    pub failed: Vec<WorkItem>,
    pub too_slow: Vec<WorkItem>,
    pub interrupted: Vec<WorkItem>,
    pub in_progress: Vec<WorkItem>,
}

impl RunSummary {
    pub fn new(run: Run, work_items: Vec<WorkItem>) -> Self {
        let mut summary = Self {
            run,
            passed: Vec::new(),
            failed: Vec::new(),
            too_slow: Vec::new(),
            interrupted: Vec::new(),
            in_progress: Vec::new(),
        };

        for item in work_items {
            match item.status {
                WorkItemStatus::Success => summary.passed.push(item),
                WorkItemStatus::Failure => summary.failed.push(item),
                WorkItemStatus::TooSlow => summary.too_slow.push(item),
                WorkItemStatus::Interrupted => summary.interrupted.push(item),
                WorkItemStatus::InProgress => summary.in_progress.push(item),
                // never persisted
                WorkItemStatus::NotStarted => {}
            }
        }

        for bucket in [
            &mut summary.passed,
            &mut summary.failed,
            &mut summary.too_slow,
            &mut summary.interrupted,
            &mut summary.in_progress,
        ] {
            bucket.sort_by(|a, b| a.id.cmp(&b.id));
        }

        summary
    }

    pub fn num_tests(&self) -> u64 {
        self.run.num_tests.unwrap_or(0)
    }

    /// All work items with a record, in partition order
    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.passed
            .iter()
            .chain(&self.failed)
            .chain(&self.too_slow)
            .chain(&self.interrupted)
            .chain(&self.in_progress)
    }

    /// Ids from the work-item count mapping that have no record yet
    pub fn not_started_ids(&self) -> Vec<&str> {
        let Some(counts) = &self.run.work_item_counts else {
            return Vec::new();
        };
        counts
            .keys()
            .filter(|id| !self.work_items().any(|item| &item.id == *id))
            .map(String::as_str)
            .collect()
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress::from_summary(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.progress();
        writeln!(f, "{}", self.run)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for item in self.work_items() {
            writeln!(f, "  {item}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        write!(f, "{progress}")
    }
}

/// Sub-case level progress counters of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub num_tests: u64,
    pub num_passed: u64,
    pub num_failed: u64,
    pub num_too_slow: u64,
    pub num_interrupted: u64,
    pub num_in_progress: u64,
    pub num_finished: u64,
    pub num_not_started: u64,
}

impl RunProgress {
    pub fn from_summary(summary: &RunSummary) -> Self {
        let mut progress = RunProgress {
            num_tests: summary.num_tests(),
            ..Default::default()
        };

        for item in &summary.passed {
            // no failures, so every sub-case passed
            let n = u64::from(item.sub_case_count);
            progress.num_passed += n;
            progress.num_finished += n;
        }
        for item in &summary.failed {
            let n = u64::from(item.sub_case_count);
            let failures = item.num_failures() as u64;
            progress.num_passed += n.saturating_sub(failures);
            progress.num_failed += failures;
            progress.num_finished += n;
        }
        for item in &summary.too_slow {
            let n = u64::from(item.sub_case_count);
            progress.num_too_slow += n;
            progress.num_finished += n;
        }
        for item in &summary.interrupted {
            let n = u64::from(item.sub_case_count);
            progress.num_interrupted += n;
            progress.num_finished += n;
        }
        for item in &summary.in_progress {
            progress.num_in_progress += u64::from(item.sub_case_count);
        }

        progress.num_not_started = progress
            .num_tests
            .saturating_sub(progress.num_finished + progress.num_in_progress);
        progress
    }

    pub fn pct_complete(&self) -> f64 {
        if self.num_tests == 0 {
            0.0
        } else {
            (self.num_finished as f64 / self.num_tests as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.num_tests > 0 && self.num_finished == self.num_tests
    }
}

impl fmt::Display for RunProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Finished: {}/{} ({:.0}%)",
            self.num_finished,
            self.num_tests,
            self.pct_complete()
        )?;
        write!(
            f,
            "Pass: {} | Fail: {} | Too slow: {} | Interrupted: {} | In progress: {} | Not started: {}",
            self.num_passed,
            self.num_failed,
            self.num_too_slow,
            self.num_interrupted,
            self.num_in_progress,
            self.num_not_started
        )
    }
}

/// Whether every work item of a run has reached a terminal state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    /// At least one work item is still in progress
    InProgress,
    /// No item in progress, but some items have no record yet
    Pending { finished: u64, expected: Option<u64> },
    /// Every expected work item is terminal
    Complete,
}

impl CompletionState {
    pub fn evaluate(run: &Run, work_items: &[WorkItem]) -> Self {
        if work_items
            .iter()
            .any(|item| item.status == WorkItemStatus::InProgress)
        {
            return CompletionState::InProgress;
        }

        let finished = work_items
            .iter()
            .filter(|item| item.status.is_terminal())
            .count() as u64;
        match run.num_test_entities {
            Some(expected) if finished == expected => CompletionState::Complete,
            expected => CompletionState::Pending { finished, expected },
        }
    }
}
