use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::defaults;

/// Top-level configuration for botdetect.
/// Deserializes from an optional TOML configuration file; every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_detection_config")]
    pub detection: DetectionConfig,

    #[serde(default = "defaults::default_filter_config")]
    pub filter: FilterConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;

        if d.timeslot_secs == 0 {
            bail!("detection.timeslot_secs must be greater than zero");
        }
        if d.window_secs < d.timeslot_secs {
            bail!(
                "detection.window_secs ({}) must be at least detection.timeslot_secs ({})",
                d.window_secs,
                d.timeslot_secs
            );
        }
        if d.decision_interval_ms == 0 {
            bail!("detection.decision_interval_ms must be greater than zero");
        }
        if d.expire_interval_ms == 0 {
            bail!("detection.expire_interval_ms must be greater than zero");
        }
        if d.blacklist_ttl_secs == 0 {
            bail!("detection.blacklist_ttl_secs must be greater than zero");
        }
        if !d.max_ratio.is_finite() || d.max_ratio < 0.0 {
            bail!("detection.max_ratio must be a finite, non-negative number");
        }
        if d.timestamp_format.is_empty() {
            bail!("detection.timestamp_format must not be empty");
        }

        // chrono reports bad specifiers through fmt::Error; probe once here so the
        // clock never has to.
        use std::fmt::Write;
        let mut probe = String::new();
        write!(probe, "{}", chrono::Utc::now().format(&d.timestamp_format)).map_err(|_| {
            anyhow::anyhow!("invalid detection.timestamp_format: {}", d.timestamp_format)
        })?;

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detection: defaults::default_detection_config(),
            filter: defaults::default_filter_config(),
            logging: defaults::default_logging_config(),
        }
    }
}

/// Aggregation window, decision heuristic and blacklist tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Width of one aggregation bucket.
    #[serde(default = "defaults::default_timeslot_secs")]
    pub timeslot_secs: u64,

    /// Retention horizon; buckets older than this are discarded.
    #[serde(default = "defaults::default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::default_decision_interval_ms")]
    pub decision_interval_ms: u64,

    #[serde(default = "defaults::default_expire_interval_ms")]
    pub expire_interval_ms: u64,

    /// Minimum number of application requests before an IP is considered at all.
    #[serde(default = "defaults::default_max_requests")]
    pub max_requests: u64,

    /// Threshold for total/application requests.
    #[serde(default = "defaults::default_max_ratio")]
    pub max_ratio: f64,

    #[serde(default = "defaults::default_blacklist_ttl_secs")]
    pub blacklist_ttl_secs: u64,

    /// strftime-style label for the current slot (`%H:%M` = hour:minute).
    #[serde(default = "defaults::default_timestamp_format")]
    pub timestamp_format: String,
}

impl DetectionConfig {
    pub fn timeslot(&self) -> Duration {
        Duration::from_secs(self.timeslot_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn decision_interval(&self) -> Duration {
        Duration::from_millis(self.decision_interval_ms)
    }

    pub fn expire_interval(&self) -> Duration {
        Duration::from_millis(self.expire_interval_ms)
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl_secs)
    }
}

/// Candidate IP filtering.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "defaults::default_ignore_private_ips")]
    pub ignore_private_ips: bool,
}

/// Logging configuration. Logs always go to stderr; stdout carries verdicts.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    /// Trace every decision the program makes.
    #[serde(default)]
    pub trace: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub json: bool,

    /// How often engine stats are logged; 0 disables the reporter.
    #[serde(default = "defaults::default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}
