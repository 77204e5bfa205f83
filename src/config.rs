//! ==============================================================================
//! config.rs - runtime configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - PollingConfig: how often the store polls its source.
//!     - SourceConfig: json file or synthetic generator, watcher settings.
//!     - StoreConfig / WindowConfig / WarningsConfig: query behaviour.
//!     - ServerConfig / DisplayConfig / AccessConfig: http surface.
//!     - thresholds: per-parameter overrides on top of the default table.
//!
//!     every section has defaults, so a partial file only needs the keys
//!     it changes.
//!
//! ==============================================================================

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{Parameter, Threshold, ThresholdTable};
use crate::window::EmptyWindowPolicy;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub polling: PollingConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub window: WindowConfig,
    pub warnings: WarningsConfig,
    pub server: ServerConfig,
    pub display: DisplayConfig,
    pub access: AccessConfig,
    pub logging: LoggingConfig,
    /// keyed by parameter key, e.g. `[thresholds.co2]`
    pub thresholds: BTreeMap<String, ThresholdOverride>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_seconds: 30 }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Synthetic,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
    /// watch the file and refresh on change, on top of the poll timer
    pub watch: bool,
    pub debounce_ms: u64,
    pub synthetic_capacity: usize,
    pub synthetic_parameters: Vec<Parameter>,
    pub seed: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::File,
            path: PathBuf::from("data").join("readings.json"),
            watch: true,
            debounce_ms: 500,
            synthetic_capacity: 100,
            synthetic_parameters: Parameter::ALL.to_vec(),
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub synthetic_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            synthetic_fallback: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyPolicyKind {
    MostRecent,
    MostRecentN,
    Empty,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub empty_policy: EmptyPolicyKind,
    /// only read for `most-recent-n`
    pub fallback_count: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            empty_policy: EmptyPolicyKind::MostRecent,
            fallback_count: 1,
        }
    }
}

impl WindowConfig {
    pub fn policy(&self) -> EmptyWindowPolicy {
        match self.empty_policy {
            EmptyPolicyKind::MostRecent => EmptyWindowPolicy::MostRecent,
            EmptyPolicyKind::MostRecentN => EmptyWindowPolicy::MostRecentN(self.fallback_count),
            EmptyPolicyKind::Empty => EmptyWindowPolicy::Empty,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WarningsConfig {
    pub retention_hours: u64,
}

impl Default for WarningsConfig {
    fn default() -> Self {
        Self { retention_hours: 24 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DisplayConfig {
    /// minutes east of utc used for chart and export labels
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// empty = any non-blank code is accepted
    pub device_codes: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct ThresholdOverride {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HostConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        // reject bad values at load time, not on first request
        config.threshold_table()?;
        config.warning_retention()?;

        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("config").join("host.toml");

        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    println!("[CONFIG] Loaded from {}", path.display());
                    return config;
                }
                Err(e) => {
                    println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Default threshold table with the `[thresholds.*]` overrides applied.
    pub fn threshold_table(&self) -> anyhow::Result<ThresholdTable> {
        let mut table = ThresholdTable::default();
        for (key, ov) in &self.thresholds {
            let parameter: Parameter = key
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid [thresholds.{}]: {}", key, e))?;
            let base = table
                .get(parameter)
                .copied()
                .unwrap_or(Threshold::new(0.0, f64::INFINITY));
            let threshold = Threshold::new(ov.low.unwrap_or(base.low), ov.high.unwrap_or(base.high));
            if threshold.has_low_bound() && threshold.low > threshold.high {
                anyhow::bail!(
                    "Invalid [thresholds.{}]: low {} is above high {}",
                    key,
                    threshold.low,
                    threshold.high
                );
            }
            table.set(parameter, threshold);
        }
        Ok(table)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_seconds.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.source.debounce_ms)
    }

    pub fn warning_retention(&self) -> anyhow::Result<chrono::Duration> {
        let hours = self.warnings.retention_hours;
        i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .ok_or_else(|| anyhow::anyhow!("Invalid [warnings]: retention_hours {} is too large", hours))
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let source = match self.source.kind {
            SourceKind::File => format!("file {}", self.source.path.display()),
            SourceKind::Synthetic => format!("synthetic x{}", self.source.synthetic_capacity),
        };
        let access = if self.access.device_codes.is_empty() {
            "any code".to_string()
        } else {
            format!("{} device code(s)", self.access.device_codes.len())
        };
        println!("┌─────────────────────────────────────────┐");
        println!("│           HOST CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Source: {}", source);
        println!("│ Watch: {} (debounce {}ms)", self.source.watch, self.source.debounce_ms);
        println!("│ Poll Interval: {}s", self.polling.interval_seconds);
        println!("│ Synthetic Fallback: {}", self.store.synthetic_fallback);
        println!("│ Bind: {}", self.server.bind);
        println!("│ Access: {}", access);
        println!("│ Log Level: {}", self.logging.level);
        println!("├─────────────────────────────────────────┤");
    }
}
