//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;
use std::path::PathBuf;

use super::AppConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "SUITE_HARNESS";

/// Overrides read from environment variables
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvConfig {
    /// Config file from SUITE_HARNESS_CONFIG
    pub config_file: Option<String>,
    /// Worker concurrency from SUITE_HARNESS_CONCURRENT
    pub max_concurrent: Option<usize>,
    /// Batch size from SUITE_HARNESS_BATCH_SIZE
    pub batch_size: Option<usize>,
    /// Fan-in window from SUITE_HARNESS_FAN_IN_WINDOW_MS
    pub fan_in_window_ms: Option<u64>,
    /// Work item deadline from SUITE_HARNESS_DEADLINE_SECS
    pub deadline_secs: Option<u64>,
    /// Status URL base from SUITE_HARNESS_SERVER_URL
    pub server_url: Option<String>,
    /// Snapshot directory from SUITE_HARNESS_DATA_DIR
    pub data_dir: Option<String>,
    /// Log filter from SUITE_HARNESS_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            max_concurrent: get_env_parse("CONCURRENT"),
            batch_size: get_env_parse("BATCH_SIZE"),
            fan_in_window_ms: get_env_parse("FAN_IN_WINDOW_MS"),
            deadline_secs: get_env_parse("DEADLINE_SECS"),
            server_url: get_env("SERVER_URL"),
            data_dir: get_env("DATA_DIR"),
            log: get_env("LOG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        *self != Self::default()
    }

    /// Overlay the set variables onto `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(n) = self.max_concurrent {
            config.execution.max_concurrent = n;
        }
        if let Some(n) = self.batch_size {
            config.dispatch.max_batch_size = n;
        }
        if let Some(ms) = self.fan_in_window_ms {
            config.dispatch.fan_in_window_ms = ms;
        }
        if let Some(secs) = self.deadline_secs {
            config.execution.work_item_deadline_secs = Some(secs);
        }
        if let Some(url) = &self.server_url {
            config.server_url = url.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        if !self.has_any() {
            println!("  (no {ENV_PREFIX}_* variables set)");
            return;
        }
        println!("  {}_CONFIG:           {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_CONCURRENT:       {:?}", ENV_PREFIX, self.max_concurrent);
        println!("  {}_BATCH_SIZE:       {:?}", ENV_PREFIX, self.batch_size);
        println!("  {}_FAN_IN_WINDOW_MS: {:?}", ENV_PREFIX, self.fan_in_window_ms);
        println!("  {}_DEADLINE_SECS:    {:?}", ENV_PREFIX, self.deadline_secs);
        println!("  {}_SERVER_URL:       {:?}", ENV_PREFIX, self.server_url);
        println!("  {}_DATA_DIR:         {:?}", ENV_PREFIX, self.data_dir);
        println!("  {}_LOG:              {:?}", ENV_PREFIX, self.log);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Print all SUITE_HARNESS environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG            Path to configuration file");
    println!("  {ENV_PREFIX}_CONCURRENT        Work items executed at the same time");
    println!("  {ENV_PREFIX}_BATCH_SIZE        Work items per enqueue call");
    println!("  {ENV_PREFIX}_FAN_IN_WINDOW_MS  Completion-check debounce window");
    println!("  {ENV_PREFIX}_DEADLINE_SECS     Per-work-item deadline");
    println!("  {ENV_PREFIX}_SERVER_URL        Base URL for run status links");
    println!("  {ENV_PREFIX}_DATA_DIR          Directory of the store snapshot");
    println!("  {ENV_PREFIX}_LOG               Log filter (overrides --verbose)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_CONCURRENT=8");
    println!("  suite-harness run --suite smoke");
}
