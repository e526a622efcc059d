//! Engine configuration management

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default log filter when RUST_LOG is not set
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
    /// Device-list change notifier tuning
    #[serde(default)]
    pub notifier: NotifierSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            notifier: NotifierSettings::default(),
        }
    }
}

impl Config {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML config string.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }
        self.notifier.validate()
    }
}

/// Notifier debounce minimums. Defaults match the behavior this was tuned
/// against: arrivals settle for a second, device-tree reshapes for two,
/// removals dispatch almost immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Minimum delay before an arrival burst triggers a re-sync (ms)
    #[serde(default = "NotifierSettings::default_arrival_debounce_ms")]
    pub arrival_debounce_ms: u64,
    /// Minimum delay before removal marks are dispatched (ms)
    #[serde(default = "NotifierSettings::default_removal_debounce_ms")]
    pub removal_debounce_ms: u64,
    /// Minimum delay before a nodes-changed burst triggers a re-sync (ms)
    #[serde(default = "NotifierSettings::default_nodes_changed_debounce_ms")]
    pub nodes_changed_debounce_ms: u64,
    /// Capacity of the notifier's command/signal queue
    #[serde(default = "NotifierSettings::default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            arrival_debounce_ms: Self::default_arrival_debounce_ms(),
            removal_debounce_ms: Self::default_removal_debounce_ms(),
            nodes_changed_debounce_ms: Self::default_nodes_changed_debounce_ms(),
            channel_capacity: Self::default_channel_capacity(),
        }
    }
}

impl NotifierSettings {
    fn default_arrival_debounce_ms() -> u64 {
        1000
    }

    fn default_removal_debounce_ms() -> u64 {
        1
    }

    fn default_nodes_changed_debounce_ms() -> u64 {
        2000
    }

    fn default_channel_capacity() -> usize {
        256
    }

    pub fn arrival_debounce(&self) -> Duration {
        Duration::from_millis(self.arrival_debounce_ms)
    }

    pub fn removal_debounce(&self) -> Duration {
        Duration::from_millis(self.removal_debounce_ms)
    }

    pub fn nodes_changed_debounce(&self) -> Duration {
        Duration::from_millis(self.nodes_changed_debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.arrival_debounce_ms == 0 {
            bail!("arrival_debounce_ms must be nonzero");
        }
        if self.nodes_changed_debounce_ms == 0 {
            bail!("nodes_changed_debounce_ms must be nonzero");
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be nonzero");
        }
        Ok(())
    }
}
