// ABOUTME: TOML configuration for the relay: endpoints, queue, pacing and tracked tables
// ABOUTME: Every section has defaults so a file only needs what differs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::validate_identifier;

fn default_schema() -> String {
    "public".to_string()
}

fn default_version_column() -> String {
    "rowver".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub target: Option<TargetConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Appended to the source table name to form the target table name
    #[serde(default)]
    pub table_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub lock_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".change-relay/relay-queue.db"),
            lock_seconds: 30,
            poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    pub state_path: PathBuf,
    pub table_delay_ms: u64,
    pub pass_backoff_ms: u64,
    /// Maximum rows extracted per table per cycle; unset reads everything
    pub batch_size: Option<usize>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(".change-relay/watermarks.json"),
            table_delay_ms: 100,
            pass_backoff_ms: 5000,
            batch_size: Some(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliverySettings {
    pub max_concurrent: usize,
    pub idle_wait_ms: u64,
    pub max_delivery_count: Option<u32>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            idle_wait_ms: 1000,
            max_delivery_count: Some(10),
        }
    }
}

/// One tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "default_version_column")]
    pub version_column: String,
    /// Overrides the identity column reported by the source
    #[serde(default)]
    pub identity_column: Option<String>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_column: default_version_column(),
            identity_column: None,
        }
    }

    pub fn with_version_column(mut self, column: impl Into<String>) -> Self {
        self.version_column = column.into();
        self
    }

    pub fn with_identity_column(mut self, column: impl Into<String>) -> Self {
        self.identity_column = Some(column.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)
            .with_context(|| format!("Invalid table name '{}'", self.name))?;
        validate_identifier(&self.version_column).with_context(|| {
            format!("Invalid version column for table '{}'", self.name)
        })?;
        if let Some(identity) = &self.identity_column {
            validate_identifier(identity).with_context(|| {
                format!("Invalid identity column for table '{}'", self.name)
            })?;
            if identity == &self.version_column {
                bail!(
                    "Table '{}' uses '{}' as both identity and version column",
                    self.name,
                    identity
                );
            }
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: RelayConfig =
            toml::from_str(contents).context("Failed to parse relay configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.name.as_str()) {
                bail!("Table '{}' is listed more than once", table.name);
            }
        }
        if let Some(source) = &self.source {
            validate_identifier(&source.schema).context("Invalid source schema")?;
        }
        if let Some(target) = &self.target {
            validate_identifier(&target.schema).context("Invalid target schema")?;
            if !target.table_suffix.is_empty()
                && !target
                    .table_suffix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                bail!(
                    "Target table_suffix '{}' may only contain letters, digits and underscores",
                    target.table_suffix
                );
            }
        }
        if self.delivery.max_concurrent == 0 {
            bail!("delivery.max_concurrent must be at least 1");
        }
        if self.delivery.max_delivery_count == Some(0) {
            bail!("delivery.max_delivery_count must be at least 1 when set");
        }
        if self.sync.batch_size == Some(0) {
            bail!("sync.batch_size must be at least 1 when set");
        }
        Ok(())
    }
}
