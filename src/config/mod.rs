//! Configuration module
//!
//! Application settings, the config file holding suite definitions, and
//! environment overrides.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
#[cfg(test)]
pub use file::ItemDefinition;
pub use file::{CaseDefinition, ConfigFile, NotificationConfig, SuiteDefinition};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::{DEFAULT_FAN_IN_WINDOW, DEFAULT_MAX_BATCH_SIZE};
use crate::persistence::DEFAULT_MAX_TEXT_LEN;

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AppConfig {
    /// Fan-out batching and fan-in debouncing
    pub dispatch: DispatchConfig,

    /// Run creation and work-item execution
    pub execution: ExecutionConfig,

    /// Local queue delivery behaviour
    pub queue: QueueConfig,

    /// Persisted state
    pub storage: StorageConfig,

    /// Base URL used to build run status links
    pub server_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            execution: ExecutionConfig::default(),
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            server_url: "http://localhost:8080".to_string(),
        }
    }
}

impl AppConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }
}

/// Dispatch settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum work items per enqueue call
    pub max_batch_size: usize,

    /// Width of the completion-check debounce window in milliseconds
    pub fan_in_window_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            fan_in_window_ms: DEFAULT_FAN_IN_WINDOW.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn fan_in_window(&self) -> Duration {
        Duration::from_millis(self.fan_in_window_ms)
    }
}

/// Execution settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Time budget for creating a run, in seconds
    pub create_run_budget_secs: u64,

    /// Per-work-item deadline in seconds; unlimited when unset
    pub work_item_deadline_secs: Option<u64>,

    /// Work items executed at the same time
    pub max_concurrent: usize,

    /// Shell used to run case commands
    pub shell: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            create_run_budget_secs: 60,
            work_item_deadline_secs: Some(600),
            max_concurrent: 4,
            shell: "sh".to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn create_run_budget(&self) -> Duration {
        Duration::from_secs(self.create_run_budget_secs)
    }

    pub fn work_item_deadline(&self) -> Option<Duration> {
        self.work_item_deadline_secs.map(Duration::from_secs)
    }
}

/// Queue settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries of a failing task before it is dropped
    pub max_attempts: u32,

    /// Delay before a failed task is redelivered, in milliseconds
    pub retry_delay_ms: u64,

    /// Probability (0.0 to 1.0) of delivering a handled task a second time
    pub duplicate_delivery_rate: f64,

    /// Seconds a task name stays reserved for deduplication
    pub name_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
            duplicate_delivery_rate: 0.0,
            name_ttl_secs: 3600,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn name_ttl(&self) -> Duration {
        Duration::from_secs(self.name_ttl_secs)
    }
}

/// Storage settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Characters of failure text kept in the indexed prefix
    pub max_indexed_text_len: usize,

    /// Directory of the store snapshot; platform data dir when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_indexed_text_len: DEFAULT_MAX_TEXT_LEN,
            data_dir: None,
        }
    }
}

impl StorageConfig {
    /// Snapshot file of the store
    pub fn snapshot_path(&self) -> PathBuf {
        let dir = self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("suite-harness"))
                .unwrap_or_else(|| PathBuf::from(".suite-harness"))
        });
        dir.join("store.json")
    }
}
