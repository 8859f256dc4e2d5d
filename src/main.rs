//! Suite Harness - Fan-out Test Suite Runner
//!
//! A CLI tool that decomposes a test suite into independently schedulable
//! work items, executes them on an at-least-once worker pool, and tracks the
//! aggregated progress of each run.
//!
//! ## Features
//!
//! - Bounded-batch fan-out of work items
//! - Idempotent execution under duplicate and out-of-order delivery
//! - Debounced, exactly-once run completion notification
//! - Live progress summaries while a run is in flight
//! - Multiple output formats (Table, JSON, CSV)
//!
//! ## Usage
//!
//! ```bash
//! # Write an example config with two suites
//! suite-harness config init
//!
//! # Run a suite and print its summary
//! suite-harness run --suite smoke --details
//!
//! # Inspect an earlier run
//! suite-harness status 1 --format json-pretty
//! suite-harness failure 1 toolchain tmpdir
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

mod cli;
mod config;
mod coordinator;
mod dispatch;
mod harness;
mod models;
mod output;
mod persistence;
mod queue;
mod store;
#[cfg(test)]
mod testing;
mod utils;

use cli::Args;
use config::{ConfigFile, EnvConfig, NotificationConfig};
use coordinator::{CoordinatorSettings, RunCoordinator};
use harness::{CatalogDecomposer, CommandExecutor, LogListener, RunListener, WebhookListener};
use output::ResultFormatter;
use queue::{LocalQueue, LocalQueueSettings};
use store::MemoryStore;
use utils::logger::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(LogLevel::from_verbosity(args.verbose, args.quiet));

    let env = EnvConfig::load();
    let mut formatter = ResultFormatter::new(args.format);
    if args.no_color {
        formatter = formatter.no_color();
    }

    match args.command {
        cli::Command::Run(run_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            run_suite(config, run_args, &formatter).await?;
        }
        cli::Command::Suites => {
            let config = load_config(args.config.as_deref(), &env)?;
            let harness = Harness::open(&config)?;
            println!(
                "{}",
                formatter.format_suites(&harness.coordinator.get_available_suite_ids())
            );
        }
        cli::Command::Status(status_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            let harness = Harness::open(&config)?;
            let summary = harness
                .coordinator
                .get_run_summary(status_args.run_id, true)
                .await?
                .with_context(|| {
                    if harness.store.is_empty() {
                        format!(
                            "Run {} not found, no store snapshot at {}",
                            status_args.run_id,
                            config.app.storage.snapshot_path().display()
                        )
                    } else {
                        format!("Run {} not found", status_args.run_id)
                    }
                })?;
            println!("{}", formatter.format_summary(&summary, status_args.details));
        }
        cli::Command::Item(item_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            let harness = Harness::open(&config)?;
            let item = harness
                .coordinator
                .get_test_by_id(item_args.run_id, &item_args.work_item_id)
                .await?
                .with_context(|| {
                    format!(
                        "Work item {} of run {} has not started",
                        item_args.work_item_id, item_args.run_id
                    )
                })?;
            println!("{}", formatter.format_work_item(&item));
        }
        cli::Command::Failure(failure_args) => {
            let config = load_config(args.config.as_deref(), &env)?;
            let harness = Harness::open(&config)?;
            let failure = harness
                .coordinator
                .get_failure(
                    failure_args.run_id,
                    &failure_args.work_item_id,
                    &failure_args.failure_id,
                )
                .await?
                .with_context(|| {
                    format!(
                        "Failure {} of {} in run {} not found",
                        failure_args.failure_id, failure_args.work_item_id, failure_args.run_id
                    )
                })?;
            println!("{}", formatter.format_failure(&failure));
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, args.config.as_deref(), &env)?;
        }
    }

    Ok(())
}

/// Load the config file and overlay environment overrides
fn load_config(path: Option<&str>, env: &EnvConfig) -> Result<ConfigFile> {
    let mut config = match path.or(env.config_file.as_deref()) {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    env.apply(&mut config.app);
    Ok(config)
}

/// The coordinator wired to the local store and queue
struct Harness {
    coordinator: Arc<RunCoordinator>,
    queue: Arc<LocalQueue>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn open(config: &ConfigFile) -> Result<Self> {
        let app = &config.app;
        let store = Arc::new(MemoryStore::open(app.storage.snapshot_path())?);

        let queue = Arc::new(LocalQueue::new(
            LocalQueueSettings::default()
                .with_max_concurrent(app.execution.max_concurrent)
                .with_max_batch_size(app.dispatch.max_batch_size)
                .with_retries(app.queue.max_attempts, app.queue.retry_delay())
                .with_duplicate_delivery_rate(app.queue.duplicate_delivery_rate)
                .with_name_ttl(app.queue.name_ttl()),
        ));

        let mut coordinator = RunCoordinator::new(
            store.clone(),
            queue.clone(),
            Arc::new(CatalogDecomposer::new(&config.suites)),
            Arc::new(CommandExecutor::new(&config.suites).with_shell(&app.execution.shell)),
        )
        .with_settings(CoordinatorSettings::from_config(app));

        for notification in &config.notifications {
            let listener: Arc<dyn RunListener> = match notification {
                NotificationConfig::Log => Arc::new(LogListener),
                NotificationConfig::Webhook { url } => Arc::new(WebhookListener::new(url)?),
            };
            debug!("Registered {} listener", listener.name());
            coordinator = coordinator.with_listener(listener);
        }

        Ok(Self {
            coordinator: Arc::new(coordinator),
            queue,
            store,
        })
    }
}

async fn run_suite(
    mut config: ConfigFile,
    args: cli::RunArgs,
    formatter: &ResultFormatter,
) -> Result<()> {
    if let Some(n) = args.concurrent {
        config.app.execution.max_concurrent = n;
    }
    if let Some(secs) = args.deadline {
        config.app.execution.work_item_deadline_secs = Some(secs);
    }
    config.validate()?;
    let suite = config
        .suite(&args.suite)
        .with_context(|| format!("Suite {} is not defined", args.suite))?;

    let harness = Harness::open(&config)?;
    let worker = harness.queue.start(harness.coordinator.clone())?;

    info!(
        "Running suite {} ({} work items) with {} concurrent",
        suite.id,
        suite.items.len(),
        config.app.execution.max_concurrent
    );
    let result = harness.coordinator.create_new_run(&args.suite).await?;
    println!("{}", formatter.format_new_run(&result));

    let Some(run) = result.run() else {
        harness.queue.close();
        bail!(
            "Run for suite {} was not created: {}",
            args.suite,
            result.error().unwrap_or("unknown error")
        );
    };

    harness.queue.wait_idle().await;
    harness.queue.close();
    worker.await.context("Queue worker stopped unexpectedly")?;

    if let Some(summary) = harness.coordinator.get_run_summary(run.id, true).await? {
        println!("{}", formatter.format_summary(&summary, args.details));
    }

    if !args.no_save {
        harness.store.save(config.app.storage.snapshot_path())?;
    }

    Ok(())
}

fn manage_config(args: cli::ConfigArgs, path: Option<&str>, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            if Path::new(&output).exists() && !force {
                bail!("Configuration file already exists: {output}. Use --force to overwrite.");
            }
            ConfigFile::example().save(&output)?;
            println!("✓ Configuration file created: {output}");
        }

        cli::ConfigAction::Show { env: show_env, json } => {
            if show_env {
                env.print_summary();
            } else {
                let config = load_config(path, env)?;
                let content = if json {
                    serde_json::to_string_pretty(&config)?
                } else {
                    serde_yaml::to_string(&config)?
                };
                println!("{content}");
            }
        }

        cli::ConfigAction::Validate { file } => {
            let file = match file.or_else(|| path.map(str::to_string)) {
                Some(file) => file,
                None => ConfigFile::find()
                    .map(|p| p.display().to_string())
                    .context("No configuration file found")?,
            };
            match ConfigFile::load(&file) {
                Ok(config) => {
                    println!("✓ Configuration file is valid: {file}");
                    println!("  {} suites, {} notification targets", config.suites.len(), config.notifications.len());
                }
                Err(e) => {
                    println!("✗ Configuration file is invalid: {file}");
                    println!("  {e:#}");
                    std::process::exit(1);
                }
            }
        }

        cli::ConfigAction::Schema => {
            println!("{}", ConfigFile::schema()?);
        }

        cli::ConfigAction::Env => {
            config::print_env_help();
        }
    }

    Ok(())
}
