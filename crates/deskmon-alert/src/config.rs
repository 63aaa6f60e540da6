use crate::error::{MonitorError, Result};
use crate::window::{MAX_RETENTION_DAYS, MAX_SPAN_SECS};
use serde::{Deserialize, Serialize};

/// Longest accepted scheduler interval: one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Runtime settings of the monitoring engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// When false the scheduler still flushes buffered samples but skips
    /// evaluation, escalation and retention.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Per-source sample count that triggers an out-of-cycle flush.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u32,
    #[serde(default = "default_alert_retention_days")]
    pub alert_retention_days: u32,
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
    #[serde(default = "default_alert_limit")]
    pub default_alert_limit: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_max_buffer_size() -> usize {
    1000
}

fn default_metrics_retention_days() -> u32 {
    30
}

fn default_alert_retention_days() -> u32 {
    90
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_alert_limit() -> usize {
    50
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            max_buffer_size: default_max_buffer_size(),
            metrics_retention_days: default_metrics_retention_days(),
            alert_retention_days: default_alert_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
            default_alert_limit: default_alert_limit(),
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 || self.interval_secs > MAX_INTERVAL_SECS {
            return Err(MonitorError::config(format!(
                "interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            )));
        }
        if self.max_buffer_size == 0 {
            return Err(MonitorError::config("max_buffer_size must be greater than 0"));
        }
        if self.metrics_retention_days == 0 || self.metrics_retention_days > MAX_RETENTION_DAYS {
            return Err(MonitorError::config(format!(
                "metrics_retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.alert_retention_days == 0 || self.alert_retention_days > MAX_RETENTION_DAYS {
            return Err(MonitorError::config(format!(
                "alert_retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.retention_interval_secs == 0 || self.retention_interval_secs > MAX_SPAN_SECS {
            return Err(MonitorError::config(format!(
                "retention_interval_secs must be between 1 and {MAX_SPAN_SECS}"
            )));
        }
        if self.default_alert_limit == 0 {
            return Err(MonitorError::config(
                "default_alert_limit must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Returns a copy with the present fields of `update` applied, or a
    /// configuration error if the result is invalid. `self` is untouched.
    pub fn merged(&self, update: &MonitoringConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(v) = update.enabled {
            next.enabled = v;
        }
        if let Some(v) = update.interval_secs {
            next.interval_secs = v;
        }
        if let Some(v) = update.max_buffer_size {
            next.max_buffer_size = v;
        }
        if let Some(v) = update.metrics_retention_days {
            next.metrics_retention_days = v;
        }
        if let Some(v) = update.alert_retention_days {
            next.alert_retention_days = v;
        }
        if let Some(v) = update.retention_interval_secs {
            next.retention_interval_secs = v;
        }
        if let Some(v) = update.default_alert_limit {
            next.default_alert_limit = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial update accepted by `MonitoringEngine::update_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfigUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub max_buffer_size: Option<usize>,
    #[serde(default)]
    pub metrics_retention_days: Option<u32>,
    #[serde(default)]
    pub alert_retention_days: Option<u32>,
    #[serde(default)]
    pub retention_interval_secs: Option<u64>,
    #[serde(default)]
    pub default_alert_limit: Option<usize>,
}
