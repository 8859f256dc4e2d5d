//! Run coordinator
//!
//! The engine behind every endpoint: run creation and fan-out, at-least-once
//! work-item execution, completion detection, and read-side queries.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    CompletionOutcome, CoordinatorError, CoordinatorSettings, ExecuteOutcome,
    CREATE_RUN_DEADLINE_MESSAGE,
};
use crate::dispatch::DispatchBatcher;
use crate::harness::{
    build_run_status_url, CompoundListener, ExecutionContext, RunListener, SuiteDecomposer,
    TestExecutor,
};
use crate::models::{
    CompletionState, ExecutionResult, Failure, NewRunResult, Run, RunId, RunSummary, WorkItem,
    WorkItemSpec, WorkItemStatus,
};
use crate::persistence::{CreateOutcome, FinishOutcome, PersistenceGateway};
use crate::queue::{Task, TaskHandler, WorkQueue};
use crate::store::Store;
use crate::utils::Timer;

/// Orchestrates runs over injected capabilities
pub struct RunCoordinator {
    persistence: PersistenceGateway,
    dispatch: DispatchBatcher,
    decomposer: Arc<dyn SuiteDecomposer>,
    executor: Arc<dyn TestExecutor>,
    listener: CompoundListener,
    settings: CoordinatorSettings,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        decomposer: Arc<dyn SuiteDecomposer>,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            persistence: PersistenceGateway::new(store),
            dispatch: DispatchBatcher::new(queue),
            decomposer,
            executor,
            listener: CompoundListener::new(),
            settings: CoordinatorSettings::default(),
        }
    }

    /// Add a listener notified when a run finishes
    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = self.listener.with(listener);
        self
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.persistence = self.persistence.with_max_text_len(settings.max_text_len);
        self.dispatch = self
            .dispatch
            .with_max_batch_size(settings.max_batch_size)
            .with_fan_in_window(settings.fan_in_window);
        self.settings = settings;
        self
    }

    /// Create a run for `suite_id` and dispatch its work items
    ///
    /// Running out of the creation budget is reported as a failed result,
    /// not as an error.
    pub async fn create_new_run(&self, suite_id: &str) -> Result<NewRunResult, CoordinatorError> {
        let timer = Timer::start(format!("create_new_run({suite_id})"));

        let result = match timeout(self.settings.create_run_budget, self.create_run(suite_id)).await
        {
            Ok(Ok((run, counts))) => Ok(NewRunResult::created(run, counts)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Creating a run for suite {} exceeded {:?}",
                    suite_id, self.settings.create_run_budget
                );
                Ok(NewRunResult::failed(CREATE_RUN_DEADLINE_MESSAGE))
            }
        };

        timer.stop();
        result
    }

    async fn create_run(
        &self,
        suite_id: &str,
    ) -> Result<(Run, BTreeMap<String, u32>), CoordinatorError> {
        let mut run = self.persistence.new_run(self.decomposer.name()).await?;

        let items = self
            .decomposer
            .decompose(suite_id)
            .await
            .map_err(|source| CoordinatorError::Decomposer {
                suite_id: suite_id.to_string(),
                source,
            })?;

        let mut counts = BTreeMap::new();
        for item in &items {
            if counts.insert(item.id.clone(), item.sub_case_count).is_some() {
                error!("Suite {} yields work item {} twice", suite_id, item.id);
                return Err(CoordinatorError::DuplicateWorkItem(item.id.clone()));
            }
        }

        run.set_totals(&counts);
        self.persistence.update_run_totals(&run).await?;
        self.dispatch.fan_out(run.id, &items).await?;
        self.dispatch
            .schedule_work_item_counts(run.id, counts.clone())
            .await?;
        if items.is_empty() {
            // no work item will ever trigger the check
            self.dispatch.schedule_completion_check(run.id).await?;
        }

        info!(
            "Created run {} for suite {}: {} work items, {} tests",
            run.id,
            suite_id,
            items.len(),
            run.num_tests.unwrap_or(0)
        );
        Ok((run, counts))
    }

    /// Persist the work-item count mapping of a run
    pub async fn store_work_item_counts(
        &self,
        run_id: RunId,
        counts: &BTreeMap<String, u32>,
    ) -> Result<(), CoordinatorError> {
        self.persistence.add_work_item_counts(run_id, counts).await?;
        debug!("Stored {} work item counts for run {}", counts.len(), run_id);
        Ok(())
    }

    /// Handle one delivery of a work item
    ///
    /// Safe under redelivery: only the delivery that creates the record runs
    /// the executor. Executor errors and panics are recorded as a failure of
    /// the work item, never returned.
    pub async fn execute_work_item(
        &self,
        run_id: RunId,
        spec: &WorkItemSpec,
    ) -> Result<ExecuteOutcome, CoordinatorError> {
        let timer = Timer::start(format!("execute_work_item({run_id}, {})", spec.id));

        if self.persistence.get_run(run_id, false).await?.is_none() {
            error!("Work item {} delivered for unknown run {}", spec.id, run_id);
            return Err(CoordinatorError::RunNotFound(run_id));
        }

        let outcome = match self.persistence.create_work_item(run_id, spec).await? {
            CreateOutcome::Created(item) => self.run_work_item(item).await?,
            CreateOutcome::Existing(item) if item.status == WorkItemStatus::InProgress => {
                self.interrupt_work_item(item).await?
            }
            CreateOutcome::Existing(item) => {
                info!(
                    "Ignoring duplicate delivery of {} in run {} ({})",
                    item.id, run_id, item.status
                );
                ExecuteOutcome::Duplicate(item.status)
            }
        };

        timer.stop();
        Ok(outcome)
    }

    async fn run_work_item(&self, mut item: WorkItem) -> Result<ExecuteOutcome, CoordinatorError> {
        let spec = WorkItemSpec::new(&item.id, item.sub_case_count);
        let mut ctx = ExecutionContext::new(item.run_id, &spec);
        if let Some(deadline) = self.settings.work_item_deadline {
            ctx = ctx.with_deadline(deadline);
        }

        debug!(
            "Executing {} in {} with {} executor",
            item.id,
            ctx.namespace,
            self.executor.name()
        );
        let result = self.execute_isolated(ctx).await;
        let new_failures = item.apply_result(result);
        item.finish(Utc::now());

        let recorded = self.record(&item, &new_failures).await;
        // Scheduled even when recording failed so completion is never starved
        let scheduled = self.dispatch.schedule_completion_check(item.run_id).await;

        let outcome = match recorded? {
            FinishOutcome::Recorded => {
                info!("{} in run {}: {}", item.id, item.run_id, item.status);
                ExecuteOutcome::Executed(item.status)
            }
            FinishOutcome::AlreadyTerminal(status) => ExecuteOutcome::Duplicate(status),
        };
        scheduled?;
        Ok(outcome)
    }

    /// Run the executor on its own task so a panic is contained
    async fn execute_isolated(&self, ctx: ExecutionContext) -> ExecutionResult {
        let executor = self.executor.clone();
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { executor.execute(&task_ctx).await }).await;

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let message = format!(
                    "Work item {} in run {} failed: {}",
                    ctx.work_item_id, ctx.run_id, e
                );
                error!("{}", message);
                ExecutionResult::harness_error(message, format!("{e:?}"))
            }
            Err(e) => {
                let message = format!(
                    "Work item {} in run {} panicked",
                    ctx.work_item_id, ctx.run_id
                );
                error!("{}", message);
                ExecutionResult::harness_error(message, panic_message(e))
            }
        }
    }

    /// Close a record left in progress by an earlier delivery
    async fn interrupt_work_item(
        &self,
        mut item: WorkItem,
    ) -> Result<ExecuteOutcome, CoordinatorError> {
        warn!(
            "Duplicate delivery of {} in run {} found it still in progress, marking {}",
            item.id,
            item.run_id,
            WorkItemStatus::Interrupted
        );
        item.interrupt();
        item.finish(Utc::now());

        let recorded = self.record(&item, &[]).await;
        let scheduled = self.dispatch.schedule_completion_check(item.run_id).await;

        let outcome = match recorded? {
            FinishOutcome::Recorded => ExecuteOutcome::Interrupted,
            FinishOutcome::AlreadyTerminal(status) => ExecuteOutcome::Duplicate(status),
        };
        scheduled?;
        Ok(outcome)
    }

    async fn record(
        &self,
        item: &WorkItem,
        new_failures: &[Failure],
    ) -> Result<FinishOutcome, CoordinatorError> {
        let outcome = self.persistence.finish_work_item(item, new_failures).await;
        if let Err(e) = &outcome {
            error!(
                "Failed to record {} in run {}: {}",
                item.id, item.run_id, e
            );
        }
        Ok(outcome?)
    }

    /// Notify listeners if every work item of the run is terminal
    ///
    /// Safe to call concurrently and repeatedly; at most one call per run
    /// returns [`CompletionOutcome::Notified`].
    pub async fn completion_check(&self, run_id: RunId) -> Result<CompletionOutcome, CoordinatorError> {
        let timer = Timer::start(format!("completion_check({run_id})"));

        let Some(run) = self.persistence.get_run(run_id, false).await? else {
            warn!("Completion check for unknown run {}", run_id);
            return Ok(CompletionOutcome::RunNotFound);
        };
        let items = self.persistence.work_items_for_run(run_id).await?;

        let outcome = match CompletionState::evaluate(&run, &items) {
            CompletionState::InProgress => {
                debug!("Run {} still has work items in progress", run_id);
                CompletionOutcome::InProgress
            }
            CompletionState::Pending { finished, expected } => {
                debug!(
                    "Run {}: {} of {:?} work items finished",
                    run_id, finished, expected
                );
                CompletionOutcome::Pending
            }
            CompletionState::Complete => {
                if self.persistence.create_completion_record(run_id).await? {
                    let status_url = self.build_run_status_url(run_id);
                    if self.listener.is_empty() {
                        info!("Run {} complete, no listeners registered", run_id);
                    } else {
                        info!(
                            "Run {} complete, notifying {} listeners",
                            run_id,
                            self.listener.len()
                        );
                    }
                    self.listener
                        .on_run_completion(&status_url, run_id)
                        .await
                        .map_err(|source| CoordinatorError::Notification { run_id, source })?;
                    CompletionOutcome::Notified
                } else {
                    debug!("Run {} completion already recorded", run_id);
                    CompletionOutcome::AlreadyNotified
                }
            }
        };

        timer.stop();
        Ok(outcome)
    }

    /// Progress of a run, or `None` if the run does not exist
    pub async fn get_run_summary(
        &self,
        run_id: RunId,
        load_work_item_counts: bool,
    ) -> Result<Option<RunSummary>, CoordinatorError> {
        let timer = Timer::start(format!("get_run_summary({run_id})"));

        let Some(run) = self
            .persistence
            .get_run(run_id, load_work_item_counts)
            .await?
        else {
            return Ok(None);
        };
        let items = self.persistence.work_items_for_run(run_id).await?;

        timer.stop();
        Ok(Some(RunSummary::new(run, items)))
    }

    /// A work item, or `None` if it has not started
    pub async fn get_test_by_id(
        &self,
        run_id: RunId,
        work_item_id: &str,
    ) -> Result<Option<WorkItem>, CoordinatorError> {
        Ok(self.persistence.get_work_item(run_id, work_item_id).await?)
    }

    pub async fn get_failure(
        &self,
        run_id: RunId,
        work_item_id: &str,
        failure_id: &str,
    ) -> Result<Option<Failure>, CoordinatorError> {
        Ok(self
            .persistence
            .get_failure(run_id, work_item_id, failure_id)
            .await?)
    }

    pub fn get_available_suite_ids(&self) -> Vec<String> {
        self.decomposer.available_suite_ids()
    }

    pub fn build_run_status_url(&self, run_id: RunId) -> String {
        build_run_status_url(&self.settings.server_url, run_id)
    }
}

/// Routes delivered tasks to their endpoints
#[async_trait]
impl TaskHandler for RunCoordinator {
    async fn handle(&self, task: Task) -> anyhow::Result<()> {
        match task {
            Task::ExecuteWorkItem {
                run_id,
                work_item_id,
                sub_case_count,
            } => {
                let spec = WorkItemSpec::new(work_item_id, sub_case_count);
                self.execute_work_item(run_id, &spec).await?;
            }
            Task::CompletionCheck { run_id } => {
                self.completion_check(run_id).await?;
            }
            Task::StoreWorkItemCounts { run_id, counts } => {
                self.store_work_item_counts(run_id, &counts).await?;
            }
        }
        Ok(())
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}
