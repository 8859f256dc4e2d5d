//! Test doubles for the queue and harness capabilities

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::harness::{ExecutionContext, RunListener, SuiteDecomposer, TestExecutor};
use crate::models::{ExecutionResult, Failure, RunId, WorkItemSpec};
use crate::queue::{QueueError, Task, TaskRequest, WorkQueue};

/// Queue that records what it is given and never delivers
pub struct RecordingQueue {
    max_batch_size: usize,
    requests: Mutex<Vec<TaskRequest>>,
    batches: Mutex<Vec<Vec<TaskRequest>>>,
    names: Mutex<HashSet<String>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self {
            max_batch_size: 100,
            requests: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            names: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.requests().into_iter().map(|r| r.task).collect()
    }

    pub fn batches(&self) -> Vec<Vec<TaskRequest>> {
        self.batches.lock().unwrap().clone()
    }

    /// Remove and return every recorded request
    pub fn take(&self) -> Vec<TaskRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    fn record(&self, requests: &[TaskRequest]) -> Result<(), QueueError> {
        let mut names = self.names.lock().unwrap();
        for name in requests.iter().filter_map(|r| r.options.name.as_ref()) {
            if !names.insert(name.clone()) {
                return Err(QueueError::TaskAlreadyExists(name.clone()));
            }
        }
        self.requests.lock().unwrap().extend_from_slice(requests);
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    async fn add(&self, request: TaskRequest) -> Result<(), QueueError> {
        self.record(&[request])
    }

    async fn add_batch(&self, requests: Vec<TaskRequest>) -> Result<(), QueueError> {
        if requests.len() > self.max_batch_size {
            return Err(QueueError::BatchTooLarge {
                size: requests.len(),
                max: self.max_batch_size,
            });
        }
        self.record(&requests)?;
        self.batches.lock().unwrap().push(requests);
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Decomposer over a fixed set of suites
#[derive(Default)]
pub struct FixedDecomposer {
    suites: BTreeMap<String, Vec<WorkItemSpec>>,
    delay: Duration,
}

impl FixedDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suite(mut self, id: &str, items: &[(&str, u32)]) -> Self {
        let items = items
            .iter()
            .map(|(item, n)| WorkItemSpec::new(*item, *n))
            .collect();
        self.suites.insert(id.to_string(), items);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SuiteDecomposer for FixedDecomposer {
    fn name(&self) -> &str {
        "fixed"
    }

    fn available_suite_ids(&self) -> Vec<String> {
        self.suites.keys().cloned().collect()
    }

    async fn decompose(&self, suite_id: &str) -> Result<Vec<WorkItemSpec>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.suites
            .get(suite_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown suite: {}", suite_id))
    }
}

/// Behaviour of [`ScriptedExecutor`] for one work item
#[derive(Clone, Debug)]
pub enum Script {
    /// Every sub-case passes
    Pass,
    /// The named sub-cases fail, the rest pass
    FailCases(Vec<String>),
    /// The executor returns an error
    Error(String),
    Panic,
    /// Pass after running for the given time, or report over-time when
    /// the deadline comes first
    Slow(Duration),
    /// Report over-time
    OverTime,
}

/// Executor whose outcome is scripted per work item
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
    contexts: Mutex<Vec<ExecutionContext>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, work_item_id: &str, script: Script) -> Self {
        self.scripts.insert(work_item_id.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Every context the executor was called with, in call order
    pub fn contexts(&self) -> Vec<ExecutionContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn call_count(&self, work_item_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == work_item_id).count()
    }
}

fn passing(ctx: &ExecutionContext, failing: &[String]) -> ExecutionResult {
    let mut result = ExecutionResult::new();
    let passes = ctx.sub_case_count as usize - failing.len().min(ctx.sub_case_count as usize);
    for i in 0..passes {
        result = result.with_success(format!("case-{i}"));
    }
    for name in failing {
        result = result.with_failure(Failure::new(name, format!("{name} failed"), "trace"));
    }
    result
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(ctx.work_item_id.clone());
        self.contexts.lock().unwrap().push(ctx.clone());

        let script = self
            .scripts
            .get(&ctx.work_item_id)
            .cloned()
            .unwrap_or(Script::Pass);
        match script {
            Script::Pass => Ok(passing(ctx, &[])),
            Script::FailCases(names) => Ok(passing(ctx, &names)),
            Script::Error(message) => Err(anyhow!(message)),
            Script::Panic => panic!("executor exploded on {}", ctx.work_item_id),
            Script::Slow(duration) => match ctx.remaining() {
                Some(left) if left < duration => {
                    tokio::time::sleep(left).await;
                    Ok(ExecutionResult::new().too_slow())
                }
                _ => {
                    tokio::time::sleep(duration).await;
                    Ok(passing(ctx, &[]))
                }
            },
            Script::OverTime => Ok(ExecutionResult::new().too_slow()),
        }
    }
}

/// Listener that records every notification
pub struct RecordingListener {
    notifications: Mutex<Vec<(RunId, String)>>,
    error: Option<String>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
            error: None,
        }
    }

    /// Records, then fails every call with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn notifications(&self) -> Vec<(RunId, String)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }
}

#[async_trait]
impl RunListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_run_completion(&self, status_url: &str, run_id: RunId) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((run_id, status_url.to_string()));
        match &self.error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}
