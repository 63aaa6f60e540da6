use crate::config::{MonitoringConfig, MonitoringConfigUpdate};
use crate::error::{MonitorError, Result};
use crate::evaluator::RuleEvaluator;
use crate::events::MonitorEvent;
use crate::flusher::Flusher;
use crate::lifecycle::AlertLifecycleManager;
use crate::resolver::ResolverRegistry;
use crate::rule::build_rule;
use crate::scheduler::{MonitorCore, Scheduler, TickOutcome, TickRunner};
use crate::sink::MetricSink;
use crate::stats::{compute_stats, EngineCounters, EngineStats, MonitoringStats, TimeRange};
use chrono::Utc;
use deskmon_common::types::{Alert, AlertLevel, AlertRule, AlertRuleDraft, Metadata};
use deskmon_notify::dispatcher::NotificationDispatcher;
use deskmon_storage::{AlertFilter, AlertStore, MetricsStore};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the inbound event queue between publishers and the pump.
const EVENT_QUEUE_CAPACITY: usize = 4096;

/// Filter for [`MonitoringEngine::get_alerts`].
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    /// Only alerts raised by rules this user owns.
    pub user_id: Option<String>,
    pub level: Option<AlertLevel>,
    /// Falls back to `default_alert_limit` when unset.
    pub limit: Option<usize>,
}

/// Cloneable handle producers use to record samples directly.
#[derive(Clone)]
pub struct MetricRecorder {
    sink: Arc<MetricSink>,
}

impl MetricRecorder {
    pub fn record(
        &self,
        source_id: &str,
        sample_type: &str,
        value: f64,
        unit: &str,
        metadata: Metadata,
    ) {
        self.sink.record(source_id, sample_type, value, unit, metadata);
    }

    pub fn record_event(&self, event: &MonitorEvent) {
        for sample in event.to_samples() {
            self.sink.push(sample);
        }
    }
}

/// Cloneable handle producers use to hand events to the engine without
/// knowing anything about it. Never blocks.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<MonitorEvent>,
}

impl EventPublisher {
    /// Queues an event. Returns false if the queue is full or the engine has
    /// shut down; the event is then discarded.
    pub fn publish(&self, event: MonitorEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Monitoring event discarded");
                false
            }
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    pump: JoinHandle<Option<mpsc::Receiver<MonitorEvent>>>,
}

/// The monitoring engine: ingestion, scheduled evaluation and the
/// administrative API.
///
/// Construct one per process and share it by `Arc`. Nothing runs in the
/// background until [`init`](Self::init); [`cleanup`](Self::cleanup) stops
/// the loop and flushes what is still buffered.
pub struct MonitoringEngine {
    config: Arc<RwLock<MonitoringConfig>>,
    sink: Arc<MetricSink>,
    flusher: Arc<Flusher>,
    runner: Arc<TickRunner>,
    core: Arc<tokio::sync::Mutex<MonitorCore>>,
    metrics_store: Arc<dyn MetricsStore>,
    alert_store: Arc<dyn AlertStore>,
    counters: Arc<EngineCounters>,
    events_tx: mpsc::Sender<MonitorEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<MonitorEvent>>>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MonitoringEngine {
    pub fn new(
        config: MonitoringConfig,
        metrics_store: Arc<dyn MetricsStore>,
        alert_store: Arc<dyn AlertStore>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let counters = Arc::new(EngineCounters::default());
        let sink = Arc::new(MetricSink::new(config.max_buffer_size, counters.clone()));
        let flusher = Arc::new(Flusher::new(
            sink.clone(),
            metrics_store.clone(),
            counters.clone(),
        ));
        let core = Arc::new(tokio::sync::Mutex::new(MonitorCore {
            rules: Vec::new(),
            evaluator: RuleEvaluator::new(ResolverRegistry::with_builtins(), counters.clone()),
            lifecycle: AlertLifecycleManager::new(
                alert_store.clone(),
                dispatcher,
                counters.clone(),
            ),
        }));
        let config = Arc::new(RwLock::new(config));
        let runner = Arc::new(TickRunner::new(
            core.clone(),
            flusher.clone(),
            metrics_store.clone(),
            alert_store.clone(),
            config.clone(),
            counters.clone(),
        ));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Ok(Self {
            config,
            sink,
            flusher,
            runner,
            core,
            metrics_store,
            alert_store,
            counters,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        })
    }

    /// Loads unresolved alerts so pending escalations survive a restart,
    /// then starts the scheduler loop and the event pump.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// running is a no-op.
    pub async fn init(&self) -> Result<()> {
        if lock(&self.running).is_some() {
            tracing::warn!("Monitoring engine already running");
            return Ok(());
        }

        self.core.lock().await.lifecycle.load_active()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        self.sink.attach_flush_requests(flush_tx);

        let scheduler = Scheduler::new(self.runner.clone(), self.flusher.clone(), self.config.clone());
        let scheduler = tokio::spawn(scheduler.run(stop_rx.clone(), flush_rx));

        let events_rx = lock(&self.events_rx).take();
        let pump = tokio::spawn(pump_events(events_rx, self.recorder(), stop_rx));

        *lock(&self.running) = Some(Running {
            stop: stop_tx,
            scheduler,
            pump,
        });
        tracing::info!("Monitoring engine started");
        Ok(())
    }

    /// Stops the background loop, drains queued events and performs one final
    /// flush. Safe to call more than once.
    pub async fn cleanup(&self) {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };

        let _ = running.stop.send(true);
        if let Err(e) = running.scheduler.await {
            tracing::error!(error = %e, "Monitoring scheduler task failed");
        }
        match running.pump.await {
            Ok(events) => *lock(&self.events_rx) = events,
            Err(e) => tracing::error!(error = %e, "Monitoring event pump failed"),
        }
        self.sink.detach_flush_requests();

        match self.flusher.flush() {
            Ok(count) => tracing::info!(flushed = count, "Monitoring engine stopped"),
            Err(e) => tracing::error!(error = %e, "Final flush failed during shutdown"),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn recorder(&self) -> MetricRecorder {
        MetricRecorder {
            sink: self.sink.clone(),
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.events_tx.clone(),
        }
    }

    /// Runs one tick now, subject to the same non-overlap guard as the
    /// scheduler.
    pub async fn tick_now(&self) -> TickOutcome {
        self.runner.tick(Utc::now()).await
    }

    // ---- Rules ----

    /// Validates and registers a rule.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] if the draft is malformed or
    /// a rule with the same ID exists; nothing is stored in that case.
    pub async fn add_alert_rule(&self, draft: AlertRuleDraft) -> Result<AlertRule> {
        let rule = build_rule(draft)?;
        let mut core = self.core.lock().await;
        if core.rules.iter().any(|r| r.id == rule.id) {
            return Err(MonitorError::Configuration(format!(
                "alert rule {} already exists",
                rule.id
            )));
        }
        tracing::info!(
            rule_id = %rule.id,
            name = %rule.name,
            metric = %rule.conditions.metric,
            "Alert rule added"
        );
        core.rules.push(rule.clone());
        Ok(rule)
    }

    pub async fn list_alert_rules(&self) -> Vec<AlertRule> {
        self.core.lock().await.rules.clone()
    }

    pub async fn set_alert_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut core = self.core.lock().await;
        match core.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                tracing::info!(rule_id, enabled, "Alert rule toggled");
                true
            }
            None => false,
        }
    }

    /// Removes a rule. Its existing alerts stay in the store and can still
    /// be acknowledged or resolved, but no longer escalate.
    pub async fn remove_alert_rule(&self, rule_id: &str) -> bool {
        let mut core = self.core.lock().await;
        let before = core.rules.len();
        core.rules.retain(|r| r.id != rule_id);
        let removed = core.rules.len() < before;
        if removed {
            core.evaluator.forget(rule_id);
            tracing::info!(rule_id, "Alert rule removed");
        }
        removed
    }

    // ---- Alerts ----

    /// Newest alerts first, resolved ones included.
    pub async fn get_alerts(&self, query: AlertQuery) -> Result<Vec<Alert>> {
        let limit = query
            .limit
            .unwrap_or_else(|| self.config().default_alert_limit);

        Ok(self.alert_store.query(&AlertFilter {
            owner_id: query.user_id,
            level: query.level,
            limit: Some(limit),
            ..Default::default()
        })?)
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        Ok(self.alert_store.get(alert_id)?)
    }

    /// Returns false if the alert does not exist or is already resolved.
    pub async fn acknowledge_alert(&self, alert_id: &str, user_id: &str) -> Result<bool> {
        self.core
            .lock()
            .await
            .lifecycle
            .acknowledge(alert_id, user_id, Utc::now())
    }

    /// Returns false if the alert does not exist.
    pub async fn resolve_alert(
        &self,
        alert_id: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> Result<bool> {
        self.core
            .lock()
            .await
            .lifecycle
            .resolve(alert_id, user_id, note, Utc::now())
    }

    // ---- Configuration & statistics ----

    pub fn config(&self) -> MonitoringConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies a partial update. Invalid values are rejected and the current
    /// configuration is kept. A new interval applies after the next tick.
    pub fn update_config(&self, update: MonitoringConfigUpdate) -> Result<MonitoringConfig> {
        let mut config = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = config.merged(&update)?;
        self.sink.set_max_buffer_size(next.max_buffer_size);
        *config = next.clone();
        tracing::info!(?update, "Monitoring configuration updated");
        Ok(next)
    }

    pub fn get_monitoring_stats(&self, range: TimeRange) -> Result<MonitoringStats> {
        compute_stats(
            self.metrics_store.as_ref(),
            self.alert_store.as_ref(),
            range,
            Utc::now(),
        )
    }

    pub async fn engine_stats(&self) -> EngineStats {
        let mut stats = self.counters.snapshot();
        stats.buffered_samples = self.sink.buffered();
        stats.active_alerts = self.core.lock().await.lifecycle.active_count();
        stats
    }
}

/// Feeds published events into the sink until stopped, then hands the
/// receiver back so the engine can be started again.
async fn pump_events(
    events: Option<mpsc::Receiver<MonitorEvent>>,
    recorder: MetricRecorder,
    mut stop: watch::Receiver<bool>,
) -> Option<mpsc::Receiver<MonitorEvent>> {
    let mut events = events?;
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(event) => recorder.record_event(&event),
                None => break,
            },
        }
    }
    // Whatever is already queued still counts.
    while let Ok(event) = events.try_recv() {
        recorder.record_event(&event);
    }
    Some(events)
}
