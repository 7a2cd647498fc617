//! Configuration for the NAT table.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UDPNAT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/udpnat/config.toml
//!   3. ~/.config/udpnat/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-flow queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default flow max age: five minutes of inactivity.
pub const DEFAULT_MAX_AGE_MS: u64 = 300_000;

/// Lower bound for the derived sweep interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// NAT table settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Idle time after which a flow is evicted, in milliseconds.
    pub max_age_ms: u64,
    /// Inbound packets buffered per flow before submitters block.
    pub queue_capacity: usize,
    /// Refresh a flow's last-access time on every lookup.
    pub refresh_on_access: bool,
    /// Maximum concurrent flows. 0 = unlimited.
    pub max_flows: usize,
    /// Background sweep period in milliseconds. 0 = half of max age.
    pub sweep_interval_ms: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            max_age_ms: DEFAULT_MAX_AGE_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            refresh_on_access: true,
            max_flows: 0,
            sweep_interval_ms: 0,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

// ── Construction ──────────────────────────────────────────────────────────────

impl NatConfig {
    /// Defaults with the given max age.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            max_age_ms: max_age.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// Period of the background eviction sweep.
    pub fn sweep_interval(&self) -> Duration {
        if self.sweep_interval_ms > 0 {
            return Duration::from_millis(self.sweep_interval_ms);
        }
        (self.max_age() / 2).max(MIN_SWEEP_INTERVAL)
    }

    /// Reject settings the table cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_age_ms == 0 {
            return Err(ConfigError::Invalid("max_age_ms must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be non-zero"));
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NatConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without applying env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("UDPNAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply UDPNAT_* overrides. Unparseable values are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("UDPNAT_MAX_AGE_MS").and_then(|v| v.parse().ok()) {
            self.max_age_ms = v;
        }
        if let Some(v) = var("UDPNAT_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.queue_capacity = v;
        }
        if let Some(v) = var("UDPNAT_REFRESH_ON_ACCESS") {
            self.refresh_on_access = v == "true" || v == "1";
        }
        if let Some(v) = var("UDPNAT_MAX_FLOWS").and_then(|v| v.parse().ok()) {
            self.max_flows = v;
        }
        if let Some(v) = var("UDPNAT_SWEEP_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.sweep_interval_ms = v;
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("udpnat")
}
