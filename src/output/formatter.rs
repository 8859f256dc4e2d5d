//! Output formatters for runs
//!
//! Renders run summaries, work items, failures, and creation results as a
//! table, JSON, CSV, or a one-line summary.

use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

use crate::models::{Failure, NewRunResult, RunSummary, WorkItem, WorkItemStatus};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            "csv" => Ok(OutputFormat::Csv),
            "summary" => Ok(OutputFormat::Summary),
            other => Err(format!(
                "unknown format '{other}' (expected table, json, json-pretty, csv, summary)"
            )),
        }
    }
}

/// One CSV row per work item
#[derive(Serialize)]
struct WorkItemRow<'a> {
    run_id: i64,
    work_item: &'a str,
    status: String,
    sub_cases: u32,
    passed: usize,
    failures: usize,
    duration_ms: Option<i64>,
}

impl<'a> From<&'a WorkItem> for WorkItemRow<'a> {
    fn from(item: &'a WorkItem) -> Self {
        Self {
            run_id: item.run_id,
            work_item: &item.id,
            status: item.status.to_string(),
            sub_cases: item.sub_case_count,
            passed: item.successes.len(),
            failures: item.num_failures(),
            duration_ms: item.duration_ms(),
        }
    }
}

/// Renders coordinator results in the selected format
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn status(&self, status: WorkItemStatus) -> String {
        let plain = format!("{} {}", status.symbol(), status);
        if !self.colorize {
            return plain;
        }
        let color = match status {
            WorkItemStatus::Success => "32",
            WorkItemStatus::Failure | WorkItemStatus::Interrupted => "31",
            WorkItemStatus::TooSlow => "33",
            WorkItemStatus::InProgress | WorkItemStatus::NotStarted => "36",
        };
        format!("\x1b[{color}m{plain}\x1b[0m")
    }

    /// Format the outcome of a run creation
    pub fn format_new_run(&self, result: &NewRunResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(result).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(result).unwrap_or_default(),
            _ => match result {
                NewRunResult::Created {
                    run,
                    work_item_counts,
                } => format!(
                    "✓ Created run {} ({} work items, {} tests)",
                    run.id,
                    work_item_counts.len(),
                    run.num_tests.unwrap_or(0)
                ),
                NewRunResult::Failed { error } => format!("✗ {error}"),
            },
        }
    }

    /// Format a run summary; `details` lists every work item
    pub fn format_summary(&self, summary: &RunSummary, details: bool) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary, details),
            OutputFormat::Json => serde_json::to_string(&summary_json(summary)).unwrap_or_default(),
            OutputFormat::JsonPretty => {
                serde_json::to_string_pretty(&summary_json(summary)).unwrap_or_default()
            }
            OutputFormat::Csv => to_csv(summary.work_items().map(WorkItemRow::from)),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary, details: bool) -> String {
        let progress = summary.progress();
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(
            "║  Run {:<6} {:<20} {:>25}  ║\n",
            summary.run.id,
            summary.run.decomposer_tag,
            summary.run.created.format("%Y-%m-%d %H:%M:%S")
        ));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        if details {
            for item in summary.work_items() {
                output.push_str(&format!(
                    "║  {:<24} {:<16} {:>3}/{:<3} {:>8}  ║\n",
                    item.id,
                    self.status(item.status),
                    item.successes.len(),
                    item.sub_case_count,
                    item.duration_ms()
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "-".to_string())
                ));
            }
            for id in summary.not_started_ids() {
                output.push_str(&format!(
                    "║  {:<24} {:<16}                  ║\n",
                    id,
                    self.status(WorkItemStatus::NotStarted)
                ));
            }
            output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        }

        output.push_str(&format!(
            "║  Finished: {:>6}/{:<6} ({:5.1}%)                           ║\n",
            progress.num_finished,
            progress.num_tests,
            progress.pct_complete()
        ));
        output.push_str(&format!(
            "║  Pass: {} | Fail: {} | Too slow: {} | Interrupted: {}\n",
            progress.num_passed,
            progress.num_failed,
            progress.num_too_slow,
            progress.num_interrupted
        ));
        output.push_str(&format!(
            "║  In progress: {} | Not started: {}\n",
            progress.num_in_progress, progress.num_not_started
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let progress = summary.progress();
        let state = if progress.is_complete() {
            "complete"
        } else {
            "in progress"
        };
        format!(
            "Run {}: {}/{} tests finished ({:.1}%), {} passed, {} failed [{}]",
            summary.run.id,
            progress.num_finished,
            progress.num_tests,
            progress.pct_complete(),
            progress.num_passed,
            progress.num_failed,
            state
        )
    }

    /// Format one work item
    pub fn format_work_item(&self, item: &WorkItem) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(item).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(item).unwrap_or_default(),
            OutputFormat::Csv => to_csv(std::iter::once(WorkItemRow::from(item))),
            OutputFormat::Summary => item.to_string(),
            OutputFormat::Table => {
                let mut output = format!(
                    "{} {} (run {})\n",
                    self.status(item.status),
                    item.id,
                    item.run_id
                );
                output.push_str(&format!(
                    "  Started:  {}\n",
                    item.start_time.format("%Y-%m-%d %H:%M:%S%.3f")
                ));
                if let Some(end) = item.end_time {
                    output.push_str(&format!(
                        "  Finished: {}\n",
                        end.format("%Y-%m-%d %H:%M:%S%.3f")
                    ));
                }
                output.push_str(&format!(
                    "  Passed:   {}/{}\n",
                    item.successes.len(),
                    item.sub_case_count
                ));
                for failure_id in &item.failure_ids {
                    output.push_str(&format!("  Failed:   {failure_id}\n"));
                }
                output
            }
        }
    }

    /// Format one failure with its full text
    pub fn format_failure(&self, failure: &Failure) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(failure).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(failure).unwrap_or_default(),
            OutputFormat::Csv => to_csv(std::iter::once(failure)),
            OutputFormat::Summary => format!("{}: {}", failure.id, failure.message),
            OutputFormat::Table => format!(
                "✗ {}\n  {}\n\n{}\n",
                failure.id, failure.message, failure.diagnostic
            ),
        }
    }

    /// Format the list of suite ids
    pub fn format_suites(&self, suite_ids: &[String]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(suite_ids).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(suite_ids).unwrap_or_default(),
            _ => suite_ids
                .iter()
                .map(|id| format!("  - {id}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Summary together with the derived progress counters
fn summary_json(summary: &RunSummary) -> serde_json::Value {
    serde_json::json!({
        "summary": summary,
        "progress": summary.progress(),
    })
}

fn to_csv<T: Serialize>(rows: impl IntoIterator<Item = T>) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        if let Err(e) = writer.serialize(row) {
            warn!("Failed to write CSV row: {}", e);
        }
    }
    match writer.into_inner() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Failed to flush CSV output: {}", e);
            String::new()
        }
    }
}
