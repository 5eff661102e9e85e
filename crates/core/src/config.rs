//! Timeline configuration.
//!
//! # Example
//!
//! ```toml
//! [reconcile]
//! slack_window_us = 1500000
//! max_timestamp_probes = 0
//!
//! [work_items]
//! coalesce_checkpoints = false
//! ```
//!
//! Every key is optional; missing keys take their default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use timeline_storage::Micros;

/// Default slack window: 1.5 seconds.
pub const DEFAULT_SLACK_WINDOW_US: Micros = 1_500_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimelineConfig {
    pub reconcile: ReconcileConfig,
    pub work_items: WorkItemConfig,
}

/// `[reconcile]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Out-of-order changes at most this far behind the active row are
    /// treated as clock jitter.
    pub slack_window_us: Micros,
    /// Upper bound on history collision probes per allocation; 0 means
    /// unbounded.
    pub max_timestamp_probes: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            slack_window_us: DEFAULT_SLACK_WINDOW_US,
            max_timestamp_probes: 0,
        }
    }
}

/// `[work_items]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkItemConfig {
    /// Default for callers that do not choose a checkpoint policy per call.
    pub coalesce_checkpoints: bool,
}

impl TimelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TimelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.slack_window_us < 0 {
            return Err(ConfigError::Invalid(format!(
                "reconcile.slack_window_us must not be negative (got {})",
                self.reconcile.slack_window_us
            )));
        }
        Ok(())
    }
}
