use super::settings::{DetectionConfig, FilterConfig, LoggingConfig};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_detection_config() -> DetectionConfig {
    DetectionConfig {
        timeslot_secs: default_timeslot_secs(),
        window_secs: default_window_secs(),
        decision_interval_ms: default_decision_interval_ms(),
        expire_interval_ms: default_expire_interval_ms(),
        max_requests: default_max_requests(),
        max_ratio: default_max_ratio(),
        blacklist_ttl_secs: default_blacklist_ttl_secs(),
        timestamp_format: default_timestamp_format(),
    }
}

pub fn default_filter_config() -> FilterConfig {
    FilterConfig {
        ignore_private_ips: default_ignore_private_ips(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        trace: false,
        file: None,
        json: false,
        stats_interval_secs: default_stats_interval_secs(),
    }
}

// ---------------------------------------------------------------------------
// DetectionConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_timeslot_secs() -> u64 {
    60
}

pub fn default_window_secs() -> u64 {
    3600
}

pub fn default_decision_interval_ms() -> u64 {
    5_000
}

pub fn default_expire_interval_ms() -> u64 {
    10_000
}

pub fn default_max_requests() -> u64 {
    30
}

pub fn default_max_ratio() -> f64 {
    0.85
}

pub fn default_blacklist_ttl_secs() -> u64 {
    600
}

pub fn default_timestamp_format() -> String {
    "%H:%M".to_string()
}

// ---------------------------------------------------------------------------
// FilterConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_ignore_private_ips() -> bool {
    true
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_stats_interval_secs() -> u64 {
    60
}
