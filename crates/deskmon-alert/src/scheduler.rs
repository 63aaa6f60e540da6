use crate::config::MonitoringConfig;
use crate::evaluator::RuleEvaluator;
use crate::flusher::Flusher;
use crate::lifecycle::{AlertLifecycleManager, TriggerContext};
use crate::stats::EngineCounters;
use crate::window::{days_before, elapsed};
use chrono::{DateTime, Utc};
use deskmon_common::types::AlertRule;
use deskmon_storage::{AlertFilter, AlertStore, MetricsStore};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Rule set, evaluator and alert state. Only the scheduler loop and the
/// administrative API touch it, one at a time.
pub struct MonitorCore {
    pub rules: Vec<AlertRule>,
    pub evaluator: RuleEvaluator,
    pub lifecycle: AlertLifecycleManager,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub samples_purged: u64,
    pub alerts_purged: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub flushed: usize,
    pub breaches: usize,
    pub alerts_triggered: usize,
    pub alerts_escalated: usize,
    pub retention: Option<RetentionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running.
    Skipped,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one scheduler tick: flush, evaluate, escalate, then retention when
/// due. Ticks never overlap; a tick requested while one is running is
/// skipped.
pub struct TickRunner {
    core: Arc<tokio::sync::Mutex<MonitorCore>>,
    flusher: Arc<Flusher>,
    metrics_store: Arc<dyn MetricsStore>,
    alert_store: Arc<dyn AlertStore>,
    config: Arc<RwLock<MonitoringConfig>>,
    counters: Arc<EngineCounters>,
    in_flight: AtomicBool,
    last_retention: Mutex<Option<DateTime<Utc>>>,
}

impl TickRunner {
    pub fn new(
        core: Arc<tokio::sync::Mutex<MonitorCore>>,
        flusher: Arc<Flusher>,
        metrics_store: Arc<dyn MetricsStore>,
        alert_store: Arc<dyn AlertStore>,
        config: Arc<RwLock<MonitoringConfig>>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            core,
            flusher,
            metrics_store,
            alert_store,
            config,
            counters,
            in_flight: AtomicBool::new(false),
            last_retention: Mutex::new(None),
        }
    }

    fn config(&self) -> MonitoringConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_ticking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            EngineCounters::incr(&self.counters.ticks_skipped);
            tracing::warn!("Previous monitoring tick still running, skipping");
            return TickOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let config = self.config();
        let mut report = TickReport {
            flushed: self.flusher.flush().unwrap_or(0),
            ..Default::default()
        };

        if config.enabled {
            self.evaluate_and_escalate(now, &mut report).await;
            if self.retention_due(&config, now) {
                report.retention = Some(self.run_retention(&config, now));
            }
        }

        EngineCounters::incr(&self.counters.ticks_run);
        tracing::debug!(
            flushed = report.flushed,
            breaches = report.breaches,
            triggered = report.alerts_triggered,
            escalated = report.alerts_escalated,
            "Monitoring tick completed"
        );
        TickOutcome::Completed(report)
    }

    /// Alert state changes happen under the core lock; notifications are
    /// delivered after it is released so admin calls never wait on network
    /// I/O.
    async fn evaluate_and_escalate(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let mut pending = Vec::new();

        let breaches = core
            .evaluator
            .evaluate(&core.rules, self.metrics_store.as_ref(), now);
        report.breaches = breaches.len();

        for breach in breaches {
            let Some(rule) = core.rules.iter().find(|r| r.id == breach.rule_id) else {
                continue;
            };
            let ctx = TriggerContext {
                source_execution_id: None,
                metadata: json!({
                    "metric": rule.conditions.metric.to_string(),
                    "aggregation": rule.conditions.aggregation.to_string(),
                    "timeframe_secs": rule.conditions.timeframe_secs,
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            };
            match core.lifecycle.open_alert(rule, ctx, breach.value, now) {
                Ok(notification) => {
                    report.alerts_triggered += 1;
                    pending.push(notification);
                }
                Err(e) => {
                    EngineCounters::incr(&self.counters.evaluation_failures);
                    tracing::error!(rule_id = %rule.id, error = %e, "Failed to trigger alert");
                }
            }
        }

        let escalated = core.lifecycle.escalate_due(&core.rules, now);
        report.alerts_escalated = escalated.len();
        pending.extend(escalated);

        let notifier = core.lifecycle.notifier();
        drop(guard);
        for notification in &pending {
            notifier.deliver(notification).await;
        }
    }

    fn retention_due(&self, config: &MonitoringConfig, now: DateTime<Utc>) -> bool {
        let last = self
            .last_retention
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            None => true,
            Some(at) => elapsed(at, now, config.retention_interval_secs),
        }
    }

    /// Purges samples older than the metrics retention window and resolved
    /// alerts whose resolution is older than the alert retention window.
    /// Unresolved alerts are never purged.
    pub fn run_retention(&self, config: &MonitoringConfig, now: DateTime<Utc>) -> RetentionReport {
        *self
            .last_retention
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);

        let mut report = RetentionReport::default();
        match days_before(now, config.metrics_retention_days) {
            Some(cutoff) => match self.metrics_store.purge_before(cutoff) {
                Ok(n) => report.samples_purged = n,
                Err(e) => tracing::error!(error = %e, "Failed to purge metric samples"),
            },
            None => tracing::error!(
                days = config.metrics_retention_days,
                "Metrics retention period out of range, skipping purge"
            ),
        }

        match days_before(now, config.alert_retention_days) {
            Some(cutoff) => {
                let filter = AlertFilter {
                    resolved_before: Some(cutoff),
                    ..Default::default()
                };
                match self.alert_store.delete_many(&filter) {
                    Ok(n) => report.alerts_purged = n,
                    Err(e) => tracing::error!(error = %e, "Failed to purge resolved alerts"),
                }
            }
            None => tracing::error!(
                days = config.alert_retention_days,
                "Alert retention period out of range, skipping purge"
            ),
        }

        EngineCounters::add(&self.counters.samples_purged, report.samples_purged);
        EngineCounters::add(&self.counters.alerts_purged, report.alerts_purged);
        if report.samples_purged > 0 || report.alerts_purged > 0 {
            tracing::info!(
                samples = report.samples_purged,
                alerts = report.alerts_purged,
                "Retention cleanup completed"
            );
        }
        report
    }
}

/// The single background loop driving [`TickRunner`] at the configured
/// interval and serving out-of-cycle flush requests between ticks.
pub struct Scheduler {
    runner: Arc<TickRunner>,
    flusher: Arc<Flusher>,
    config: Arc<RwLock<MonitoringConfig>>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<TickRunner>,
        flusher: Arc<Flusher>,
        config: Arc<RwLock<MonitoringConfig>>,
    ) -> Self {
        Self {
            runner,
            flusher,
            config,
        }
    }

    fn interval_secs(&self) -> u64 {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .interval_secs
            .max(1)
    }

    /// Runs until `stop` flips to true or its sender is dropped.
    pub async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        mut flush_requests: mpsc::UnboundedReceiver<String>,
    ) {
        let mut period = self.interval_secs();
        let mut ticker = interval(std::time::Duration::from_secs(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = period, "Monitoring scheduler started");

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Keep serving backpressure flushes while a slow tick
                    // waits on notification delivery.
                    let tick = self.runner.tick(Utc::now());
                    tokio::pin!(tick);
                    loop {
                        tokio::select! {
                            _ = &mut tick => break,
                            Some(source_id) = flush_requests.recv() => {
                                let _ = self.flusher.flush_source(&source_id);
                            }
                        }
                    }

                    let configured = self.interval_secs();
                    if configured != period {
                        tracing::info!(old = period, new = configured, "Monitoring interval changed");
                        period = configured;
                        let every = std::time::Duration::from_secs(period);
                        ticker = interval_at(Instant::now() + every, every);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                Some(source_id) = flush_requests.recv() => {
                    let _ = self.flusher.flush_source(&source_id);
                }
            }
        }

        tracing::info!("Monitoring scheduler stopped");
    }
}
