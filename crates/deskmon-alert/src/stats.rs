use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use deskmon_common::types::{sample_types, Aggregation};
use deskmon_notify::dispatcher::DispatchReport;
use deskmon_storage::{AggregateQuery, AlertFilter, AlertStore, MetricsStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local counters shared by every engine component.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub samples_recorded: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub samples_flushed: AtomicU64,
    pub flush_failures: AtomicU64,
    pub rules_evaluated: AtomicU64,
    pub evaluation_failures: AtomicU64,
    pub alerts_triggered: AtomicU64,
    pub alerts_escalated: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub ticks_run: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub samples_purged: AtomicU64,
    pub alerts_purged: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub(crate) fn record_dispatch(&self, report: &DispatchReport) {
        Self::add(&self.notifications_sent, report.delivered as u64);
        Self::add(&self.notifications_failed, report.failed as u64);
    }

    pub fn snapshot(&self) -> EngineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            samples_recorded: get(&self.samples_recorded),
            samples_dropped: get(&self.samples_dropped),
            samples_flushed: get(&self.samples_flushed),
            flush_failures: get(&self.flush_failures),
            rules_evaluated: get(&self.rules_evaluated),
            evaluation_failures: get(&self.evaluation_failures),
            alerts_triggered: get(&self.alerts_triggered),
            alerts_escalated: get(&self.alerts_escalated),
            notifications_sent: get(&self.notifications_sent),
            notifications_failed: get(&self.notifications_failed),
            ticks_run: get(&self.ticks_run),
            ticks_skipped: get(&self.ticks_skipped),
            samples_purged: get(&self.samples_purged),
            alerts_purged: get(&self.alerts_purged),
            buffered_samples: 0,
            active_alerts: 0,
        }
    }
}

/// Point-in-time copy of [`EngineCounters`] plus current gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub samples_recorded: u64,
    pub samples_dropped: u64,
    pub samples_flushed: u64,
    pub flush_failures: u64,
    pub rules_evaluated: u64,
    pub evaluation_failures: u64,
    pub alerts_triggered: u64,
    pub alerts_escalated: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub samples_purged: u64,
    pub alerts_purged: u64,
    pub buffered_samples: usize,
    pub active_alerts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Hour,
    Day,
    Week,
    Month,
}

impl TimeRange {
    /// A month is a fixed 30 days.
    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
            Self::Month => Duration::days(30),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        };
        f.write_str(name)
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(format!("unknown time range: {s}")),
        }
    }
}

/// Execution health summary over a trailing time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStats {
    pub time_range: TimeRange,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_alerts: u64,
    /// Percent of executions that completed.
    pub success_rate: f64,
    /// Percent of executions that failed.
    pub error_rate: f64,
    /// Mean duration of completed executions, in milliseconds.
    pub avg_execution_time: f64,
}

/// Computes [`MonitoringStats`] for the window `[now - range, now]`.
///
/// Cancelled executions count toward the total but are neither successful
/// nor failed. With no executions both rates are zero.
pub fn compute_stats(
    metrics: &dyn MetricsStore,
    alerts: &dyn AlertStore,
    range: TimeRange,
    now: DateTime<Utc>,
) -> Result<MonitoringStats> {
    let from = now - range.duration();
    let count = |types: &[&str]| -> Result<u64> {
        let query = AggregateQuery::new(types, Aggregation::Count, from, now);
        Ok(metrics.aggregate(&query)?.unwrap_or(0.0) as u64)
    };

    let successful = count(&[sample_types::EXECUTION_COMPLETED])?;
    let failed = count(&[sample_types::EXECUTION_FAILED])?;
    let cancelled = count(&[sample_types::EXECUTION_CANCELLED])?;
    let total = successful + failed + cancelled;

    let avg_execution_time = metrics
        .aggregate(&AggregateQuery::new(
            &[sample_types::EXECUTION_COMPLETED],
            Aggregation::Avg,
            from,
            now,
        ))?
        .unwrap_or(0.0);

    let total_alerts = alerts.count(&AlertFilter {
        triggered_from: Some(from),
        triggered_to: Some(now),
        ..Default::default()
    })?;

    let percent = |n: u64| {
        if total == 0 {
            0.0
        } else {
            n as f64 * 100.0 / total as f64
        }
    };

    Ok(MonitoringStats {
        time_range: range,
        total_executions: total,
        successful_executions: successful,
        failed_executions: failed,
        total_alerts,
        success_rate: percent(successful),
        error_rate: percent(failed),
        avg_execution_time,
    })
}
