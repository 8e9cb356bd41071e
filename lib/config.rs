//! Cache tuning knobs.
//!
//! Configuration may be given inline or loaded from a TOML file. Every section and field has a
//! default, so an empty document is a valid configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_hwmark() -> usize {
    100_000
}

fn default_lwmark() -> usize {
    50_000
}

fn default_run_interval_secs() -> u64 {
    90
}

fn default_attr_grace_period_secs() -> u64 {
    60
}

fn default_retention_secs() -> u64 {
    300
}

fn default_use_fd_cache() -> bool {
    true
}

fn default_lru_channel_size() -> usize {
    1024
}

fn default_grant_channel_size() -> usize {
    256
}

/// Garbage collection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GcPolicy {
    /// Entry count above which a pass culls least-recently-validated entries.
    #[serde(default = "default_hwmark")]
    pub entries_hwmark: usize,

    /// Entry count a culling pass aims for.
    #[serde(default = "default_lwmark")]
    pub entries_lwmark: usize,

    /// Seconds between background passes.
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,

    /// Minimum idle seconds before a non-directory entry may be culled. No minimum when absent.
    #[serde(default)]
    pub file_expiration_secs: Option<u64>,

    /// Minimum idle seconds before a directory may be culled. No minimum when absent.
    #[serde(default)]
    pub directory_expiration_secs: Option<u64>,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            entries_hwmark: default_hwmark(),
            entries_lwmark: default_lwmark(),
            run_interval_secs: default_run_interval_secs(),
            file_expiration_secs: None,
            directory_expiration_secs: None,
        }
    }
}

impl GcPolicy {
    /// Period of the background collector.
    #[must_use]
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    /// Idle time required before culling an entry of the given kind.
    #[must_use]
    pub fn expiration(&self, is_dir: bool) -> Option<Duration> {
        let secs = if is_dir {
            self.directory_expiration_secs
        } else {
            self.file_expiration_secs
        };
        secs.map(Duration::from_secs)
    }
}

/// Open descriptor caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DescriptorPolicy {
    /// Keep descriptors open between uses.
    #[serde(default = "default_use_fd_cache")]
    pub use_fd_cache: bool,

    /// Idle seconds after which validation closes a cached descriptor.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for DescriptorPolicy {
    fn default() -> Self {
        Self {
            use_fd_cache: default_use_fd_cache(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl DescriptorPolicy {
    /// Idle time after which a cached descriptor is closed.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Top-level configuration of an [`EntryCache`](crate::cache::EntryCache) and its lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Garbage collection policy.
    #[serde(default)]
    pub gc: GcPolicy,

    /// Descriptor cache policy.
    #[serde(default)]
    pub descriptor: DescriptorPolicy,

    /// Seconds cached attributes are trusted before a refresh goes to the backend.
    #[serde(default = "default_attr_grace_period_secs")]
    pub attr_grace_period_secs: u64,

    /// Queue depth of the LRU worker.
    #[serde(default = "default_lru_channel_size")]
    pub lru_channel_size: usize,

    /// Queue depth of the grant worker.
    #[serde(default = "default_grant_channel_size")]
    pub grant_channel_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc: GcPolicy::default(),
            descriptor: DescriptorPolicy::default(),
            attr_grace_period_secs: default_attr_grace_period_secs(),
            lru_channel_size: default_lru_channel_size(),
            grant_channel_size: default_grant_channel_size(),
        }
    }
}

/// Errors produced while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration parsed but breaks one or more rules.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The document is not valid TOML for this schema.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CacheConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every violated rule, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.gc.entries_lwmark > self.gc.entries_hwmark {
            errors.push(format!(
                "gc.entries-lwmark ({}) must not exceed gc.entries-hwmark ({}).",
                self.gc.entries_lwmark, self.gc.entries_hwmark
            ));
        }
        if self.gc.run_interval_secs == 0 {
            errors.push("gc.run-interval-secs must be positive.".to_owned());
        }
        if self.lru_channel_size == 0 {
            errors.push("lru-channel-size must be positive.".to_owned());
        }
        if self.grant_channel_size == 0 {
            errors.push("grant-channel-size must be positive.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Attribute trust period.
    #[must_use]
    pub fn attr_grace_period(&self) -> Duration {
        Duration::from_secs(self.attr_grace_period_secs)
    }

    /// Decode and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading cache configuration.");
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(?config, "Loaded cache configuration.");
        Ok(config)
    }
}
