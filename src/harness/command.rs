//! Shell command adapters
//!
//! A decomposer over the suites of the config file and an executor that runs
//! each case of a work item as a shell command.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::process::Output;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ExecutionContext, SuiteDecomposer, TestExecutor};
use crate::config::{CaseDefinition, SuiteDefinition};
use crate::models::{ExecutionResult, Failure, WorkItemSpec};

/// Decomposes the suites defined in the config file
#[derive(Clone, Debug, Default)]
pub struct CatalogDecomposer {
    suites: BTreeMap<String, Vec<WorkItemSpec>>,
}

impl CatalogDecomposer {
    pub fn new(suites: &[SuiteDefinition]) -> Self {
        Self {
            suites: suites
                .iter()
                .map(|suite| {
                    let items = suite
                        .items
                        .iter()
                        .map(|item| WorkItemSpec::new(&item.id, item.cases.len() as u32))
                        .collect();
                    (suite.id.clone(), items)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SuiteDecomposer for CatalogDecomposer {
    fn name(&self) -> &str {
        "catalog"
    }

    fn available_suite_ids(&self) -> Vec<String> {
        self.suites.keys().cloned().collect()
    }

    async fn decompose(&self, suite_id: &str) -> Result<Vec<WorkItemSpec>> {
        self.suites
            .get(suite_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown suite: {}", suite_id))
    }
}

/// Runs every case of a work item through a shell
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    shell: String,
    cases: HashMap<String, Vec<CaseDefinition>>,
}

impl CommandExecutor {
    pub fn new(suites: &[SuiteDefinition]) -> Self {
        Self {
            shell: "sh".to_string(),
            cases: suites
                .iter()
                .flat_map(|suite| &suite.items)
                .map(|item| (item.id.clone(), item.cases.clone()))
                .collect(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn command(&self, ctx: &ExecutionContext, case: &CaseDefinition) -> Command {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&case.command)
            .env("SUITE_HARNESS_NAMESPACE", &ctx.namespace)
            .env("SUITE_HARNESS_RUN_ID", ctx.run_id.to_string())
            .env("SUITE_HARNESS_WORK_ITEM", &ctx.work_item_id)
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TestExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let cases = self
            .cases
            .get(&ctx.work_item_id)
            .with_context(|| format!("No cases defined for work item {}", ctx.work_item_id))?;

        let mut result = ExecutionResult::new();
        for case in cases {
            if ctx.is_expired() {
                warn!("{} ran out of time before case {}", ctx.namespace, case.name);
                return Ok(result.too_slow());
            }

            debug!("{}: running case {}", ctx.namespace, case.name);
            let mut command = self.command(ctx, case);
            let output = match ctx.remaining() {
                Some(left) => match timeout(left, command.output()).await {
                    Ok(output) => output,
                    Err(_) => {
                        warn!("{}: case {} hit the deadline", ctx.namespace, case.name);
                        return Ok(result.too_slow());
                    }
                },
                None => command.output().await,
            };
            let output = output
                .with_context(|| format!("Failed to spawn {} for case {}", self.shell, case.name))?;

            result = if output.status.success() {
                result.with_success(&case.name)
            } else {
                result.with_failure(case_failure(&case.name, &output))
            };
        }

        Ok(result)
    }
}

/// Failure of a case whose command exited non-zero
fn case_failure(name: &str, output: &Output) -> Failure {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let message = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Command exited with {}", output.status));
    let diagnostic = format!("stdout:\n{stdout}\nstderr:\n{stderr}");

    Failure::new(name, message, diagnostic)
}
