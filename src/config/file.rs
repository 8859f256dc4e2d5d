//! Configuration file management
//!
//! Handles finding, loading, and validating configuration files.

use anyhow::{bail, Context, Result};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::AppConfig;

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./suite-harness.yaml",
    "./suite-harness.yml",
    "./.suite-harness.yaml",
    "./.suite-harness/config.yaml",
    "~/.config/suite-harness/config.yaml",
    "~/.suite-harness.yaml",
];

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Full configuration file structure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigFile {
    /// Version of config file format
    #[serde(default = "default_version")]
    pub version: String,

    /// Application settings
    #[serde(default)]
    pub app: AppConfig,

    /// Suites available to `run`
    #[serde(default)]
    pub suites: Vec<SuiteDefinition>,

    /// Listeners notified when a run finishes
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            suites: Vec::new(),
            notifications: vec![NotificationConfig::Log],
        }
    }
}

/// A named suite and the work items it decomposes into
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SuiteDefinition {
    pub id: String,

    #[serde(default)]
    pub description: String,

    pub items: Vec<ItemDefinition>,
}

/// A work item: one isolated unit of execution with named cases
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemDefinition {
    pub id: String,
    pub cases: Vec<CaseDefinition>,
}

/// One sub-case, run as a shell command; exit status 0 passes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CaseDefinition {
    pub name: String,
    pub command: String,
}

impl CaseDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Run-completion listener
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationConfig {
    /// Log the finished run
    Log,
    /// POST `{run_id, status_url}` to a URL
    Webhook { url: String },
}

impl ConfigFile {
    /// Create a new config file with defaults
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            bail!("Unsupported config version: {}", self.version);
        }

        let app = &self.app;
        if app.dispatch.max_batch_size == 0 {
            bail!("dispatch.max_batch_size must be at least 1");
        }
        if app.dispatch.fan_in_window_ms == 0 {
            bail!("dispatch.fan_in_window_ms must be at least 1");
        }
        if app.execution.max_concurrent == 0 {
            bail!("execution.max_concurrent must be at least 1");
        }
        if app.queue.name_ttl_secs == 0 {
            bail!("queue.name_ttl_secs must be greater than 0");
        }
        if app.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&app.queue.duplicate_delivery_rate) {
            bail!(
                "queue.duplicate_delivery_rate must be between 0.0 and 1.0, got {}",
                app.queue.duplicate_delivery_rate
            );
        }

        let mut suite_ids = HashSet::new();
        let mut item_owner: HashMap<&str, &str> = HashMap::new();
        for suite in &self.suites {
            if !suite_ids.insert(suite.id.as_str()) {
                bail!("Suite '{}' is defined twice", suite.id);
            }
            if suite.items.is_empty() {
                bail!("Suite '{}' has no work items", suite.id);
            }
            for item in &suite.items {
                if item.cases.is_empty() {
                    bail!("Work item '{}' in suite '{}' has no cases", item.id, suite.id);
                }
                // Commands are looked up by item id alone
                if let Some(owner) = item_owner.insert(&item.id, &suite.id) {
                    if owner != suite.id {
                        bail!(
                            "Work item '{}' is defined in both '{}' and '{}'",
                            item.id,
                            owner,
                            suite.id
                        );
                    }
                }
            }
        }

        for notification in &self.notifications {
            if let NotificationConfig::Webhook { url } = notification {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("Webhook URL must be http(s): {}", url);
                }
            }
        }

        Ok(())
    }

    /// Get suite by id
    pub fn suite(&self, id: &str) -> Option<&SuiteDefinition> {
        self.suites.iter().find(|s| s.id == id)
    }

    /// JSON schema of the config file
    pub fn schema() -> Result<String> {
        serde_json::to_string_pretty(&schema_for!(ConfigFile))
            .context("Failed to serialize config schema")
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let mut app = AppConfig::default().with_server_url("http://localhost:8080");
        app.execution.work_item_deadline_secs = Some(120);

        Self {
            version: default_version(),
            app,
            suites: vec![
                SuiteDefinition {
                    id: "smoke".to_string(),
                    description: "Quick sanity checks".to_string(),
                    items: vec![
                        ItemDefinition {
                            id: "toolchain".to_string(),
                            cases: vec![
                                CaseDefinition::new("shell", "true"),
                                CaseDefinition::new("tmpdir", "test -d /tmp"),
                            ],
                        },
                        ItemDefinition {
                            id: "environment".to_string(),
                            cases: vec![CaseDefinition::new(
                                "namespace",
                                "test -n \"$SUITE_HARNESS_NAMESPACE\"",
                            )],
                        },
                    ],
                },
                SuiteDefinition {
                    id: "nightly".to_string(),
                    description: "Long-running checks".to_string(),
                    items: vec![ItemDefinition {
                        id: "soak".to_string(),
                        cases: vec![CaseDefinition::new("sleep", "sleep 1")],
                    }],
                },
            ],
            notifications: vec![
                NotificationConfig::Log,
                NotificationConfig::Webhook {
                    url: "http://localhost:8080/hooks/run-complete".to_string(),
                },
            ],
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(id: &str) -> ItemDefinition {
        ItemDefinition {
            id: id.to_string(),
            cases: vec![CaseDefinition::new("case", "true")],
        }
    }

    fn suite(id: &str, items: &[&str]) -> SuiteDefinition {
        SuiteDefinition {
            id: id.to_string(),
            description: String::new(),
            items: items.iter().map(|i| item(i)).collect(),
        }
    }

    #[test]
    fn test_config_file_default() {
        let config = ConfigFile::default();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.notifications, vec![NotificationConfig::Log]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_is_valid() {
        let config = ConfigFile::example();
        assert!(config.validate().is_ok());
        assert!(config.suite("smoke").is_some());
        assert!(config.suite("missing").is_none());
    }

    #[test]
    fn test_config_file_save_load() {
        let dir = tempdir().unwrap();
        for name in ["config.yaml", "config.json"] {
            let path = dir.path().join("nested").join(name);
            let config = ConfigFile::example();
            config.save(&path).unwrap();

            let loaded = ConfigFile::load(&path).unwrap();
            assert_eq!(loaded, config);
        }
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "version: \"9.9\"\n").unwrap();
        assert!(ConfigFile::load(&path).is_err());
    }

    #[test]
    fn test_validate_settings() {
        let mut config = ConfigFile::default();
        config.app.dispatch.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConfigFile::default();
        config.app.dispatch.fan_in_window_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ConfigFile::default();
        config.app.queue.name_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ConfigFile::default();
        config.app.queue.duplicate_delivery_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = ConfigFile::default();
        config.notifications = vec![NotificationConfig::Webhook {
            url: "ftp://nope".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_suites() {
        let mut config = ConfigFile::default();
        config.suites = vec![suite("a", &["x"]), suite("b", &["x"])];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'x'"));

        config.suites = vec![suite("a", &[])];
        assert!(config.validate().is_err());

        config.suites = vec![suite("a", &["x"]), suite("a", &["y"])];
        assert!(config.validate().is_err());

        config.suites = vec![suite("a", &["x", "y"]), suite("b", &["z"])];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_notification_serialization() {
        let yaml = "- type: log\n- type: webhook\n  url: http://x/hook\n";
        let parsed: Vec<NotificationConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            parsed,
            vec![
                NotificationConfig::Log,
                NotificationConfig::Webhook {
                    url: "http://x/hook".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_schema() {
        let schema = ConfigFile::schema().unwrap();
        assert!(schema.contains("SuiteDefinition"));
        assert!(schema.contains("fan_in_window_ms"));
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path("./test.yaml");
        assert_eq!(path, PathBuf::from("./test.yaml"));
    }
}
