use crate::config::{MonitoringConfig, MonitoringConfigUpdate};
use crate::engine::{AlertQuery, MonitoringEngine};
use crate::error::MonitorError;
use crate::evaluator::RuleEvaluator;
use crate::events::{ExecutionEvent, ExecutionOutcome, MonitorEvent};
use crate::flusher::Flusher;
use crate::lifecycle::{severity, AlertLifecycleManager, TriggerContext};
use crate::resolver::{MetricResolver, ResolverRegistry};
use crate::rule::build_rule;
use crate::scheduler::{MonitorCore, RetentionReport, TickOutcome, TickRunner};
use crate::sink::MetricSink;
use crate::stats::{compute_stats, EngineCounters, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use deskmon_common::types::{
    sample_types, Aggregation, Alert, AlertLevel, AlertRule, AlertRuleDraft, ChannelConfig,
    ChannelKind, ConditionsDraft, EscalationPolicy, Metadata, MetricSample, NotifyTarget,
    RuleActions, RuleConditions,
};
use deskmon_notify::config::NotifyConfig;
use deskmon_notify::dispatcher::NotificationDispatcher;
use deskmon_notify::registry::ChannelRegistry;
use deskmon_notify::NotificationChannel;
use deskmon_storage::sqlite::SqliteStore;
use deskmon_storage::{AggregateQuery, AlertFilter, AlertStore, MetricsStore, StorageError};
use std::sync::{Arc, Mutex, RwLock};

// ---- Fixtures ----

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Webhook stand-in that records every alert it is asked to deliver.
#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(AlertLevel, String)>>,
}

impl RecordingChannel {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn last(&self) -> Option<(AlertLevel, String)> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(
        &self,
        alert: &Alert,
        _target: &ChannelConfig,
    ) -> deskmon_notify::error::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((alert.level, alert.message.clone()));
        Ok(())
    }
}

/// Webhook stand-in that holds every delivery until released.
#[derive(Default)]
struct GatedChannel {
    entered: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait]
impl NotificationChannel for GatedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(
        &self,
        _alert: &Alert,
        _target: &ChannelConfig,
    ) -> deskmon_notify::error::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

struct UnreachableStore;

impl MetricsStore for UnreachableStore {
    fn batch_insert(&self, _samples: &[MetricSample]) -> deskmon_storage::Result<usize> {
        Err(StorageError::Unavailable("connection refused".into()))
    }

    fn aggregate(&self, _query: &AggregateQuery) -> deskmon_storage::Result<Option<f64>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }

    fn purge_before(&self, _cutoff: DateTime<Utc>) -> deskmon_storage::Result<u64> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
}

struct BrokenResolver;

impl MetricResolver for BrokenResolver {
    fn name(&self) -> &'static str {
        "cpu_usage"
    }

    fn resolve(
        &self,
        _store: &dyn MetricsStore,
        _conditions: &RuleConditions,
        _now: DateTime<Utc>,
    ) -> crate::Result<Option<f64>> {
        Err(MonitorError::RuleEvaluation {
            rule_id: String::new(),
            reason: "sensor offline".into(),
        })
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    channel: Arc<RecordingChannel>,
    dispatcher: Arc<NotificationDispatcher>,
    counters: Arc<EngineCounters>,
}

fn harness() -> Harness {
    let channel = Arc::new(RecordingChannel::default());
    let mut registry = ChannelRegistry::new();
    registry.register(channel.clone());
    Harness {
        store: Arc::new(SqliteStore::open_in_memory().unwrap()),
        channel,
        dispatcher: Arc::new(NotificationDispatcher::new(registry)),
        counters: Arc::new(EngineCounters::default()),
    }
}

impl Harness {
    fn lifecycle(&self) -> AlertLifecycleManager {
        AlertLifecycleManager::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.counters.clone(),
        )
    }

    fn evaluator(&self) -> RuleEvaluator {
        RuleEvaluator::new(ResolverRegistry::with_builtins(), self.counters.clone())
    }

    fn engine(&self, config: MonitoringConfig) -> MonitoringEngine {
        MonitoringEngine::new(
            config,
            self.store.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
        )
        .unwrap()
    }

    fn runner(&self, rules: Vec<AlertRule>) -> (Arc<TickRunner>, Arc<tokio::sync::Mutex<MonitorCore>>) {
        let sink = Arc::new(MetricSink::new(1000, self.counters.clone()));
        let flusher = Arc::new(Flusher::new(sink, self.store.clone(), self.counters.clone()));
        let core = Arc::new(tokio::sync::Mutex::new(MonitorCore {
            rules,
            evaluator: self.evaluator(),
            lifecycle: self.lifecycle(),
        }));
        let runner = Arc::new(TickRunner::new(
            core.clone(),
            flusher,
            self.store.clone(),
            self.store.clone(),
            Arc::new(RwLock::new(MonitoringConfig::default())),
            self.counters.clone(),
        ));
        (runner, core)
    }

    fn insert(&self, sample_type: &str, value: f64, count: usize, at: DateTime<Utc>) {
        let samples: Vec<MetricSample> = (0..count)
            .map(|_| {
                MetricSample::new("adapter-1", sample_type, value, "ms", Metadata::new())
                    .with_timestamp(at)
            })
            .collect();
        self.store.batch_insert(&samples).unwrap();
    }

    /// `executed` successful commands plus `failures` failed ones.
    fn insert_outcomes(&self, executed: usize, failures: usize, at: DateTime<Utc>) {
        self.insert(sample_types::COMMAND_EXECUTED, 120.0, executed, at);
        self.insert(sample_types::COMMAND_FAILURE, 1.0, failures, at);
    }

    fn count_stored(&self, sample_type: &str) -> f64 {
        let now = Utc::now();
        let query = AggregateQuery::new(
            &[sample_type],
            Aggregation::Count,
            now - Duration::hours(1),
            now + Duration::hours(1),
        );
        self.store.aggregate(&query).unwrap().unwrap_or(0.0)
    }
}

fn webhook_target() -> NotifyTarget {
    NotifyTarget::new(ChannelConfig::Webhook {
        url: "http://hooks.local/alerts".into(),
    })
}

fn draft(metric: &str, operator: &str, threshold: f64) -> AlertRuleDraft {
    AlertRuleDraft {
        name: format!("{metric} watch"),
        conditions: ConditionsDraft {
            metric: Some(metric.into()),
            operator: Some(operator.into()),
            threshold: Some(threshold),
            ..Default::default()
        },
        actions: RuleActions {
            notify: vec![webhook_target()],
            escalation: None,
        },
        ..Default::default()
    }
}

fn rule(metric: &str, operator: &str, threshold: f64) -> AlertRule {
    build_rule(draft(metric, operator, threshold)).unwrap()
}

fn escalating_rule(delay_secs: u64, target_level: AlertLevel) -> AlertRule {
    let mut rule = rule("error_rate", ">", 10.0);
    rule.actions.escalation = Some(EscalationPolicy {
        delay_secs,
        target_level,
    });
    rule
}

// ---- Ingestion and flushing ----

#[test]
fn flush_delivers_exactly_the_recorded_samples() {
    let h = harness();
    let sink = Arc::new(MetricSink::new(1000, h.counters.clone()));
    let flusher = Flusher::new(sink.clone(), h.store.clone(), h.counters.clone());

    for i in 0..250 {
        let source = format!("exec-{}", i % 3);
        sink.record(&source, sample_types::CPU_USAGE, i as f64, "%", Metadata::new());
    }
    assert_eq!(flusher.flush().unwrap(), 250);
    assert_eq!(flusher.flush().unwrap(), 0);
    assert_eq!(h.count_stored(sample_types::CPU_USAGE), 250.0);
    assert_eq!(h.counters.snapshot().samples_flushed, 250);
}

#[test]
fn concurrent_producers_lose_nothing() {
    let h = harness();
    let sink = Arc::new(MetricSink::new(10_000, h.counters.clone()));
    let flusher = Flusher::new(sink.clone(), h.store.clone(), h.counters.clone());

    std::thread::scope(|scope| {
        for t in 0..8 {
            let sink = &sink;
            scope.spawn(move || {
                let source = format!("adapter-{}", t % 4);
                for i in 0..500 {
                    sink.record(
                        &source,
                        sample_types::COMMAND_EXECUTED,
                        i as f64,
                        "ms",
                        Metadata::new(),
                    );
                }
            });
        }
    });

    assert_eq!(sink.buffered(), 4000);
    assert_eq!(flusher.flush().unwrap(), 4000);
    assert_eq!(h.count_stored(sample_types::COMMAND_EXECUTED), 4000.0);
    assert_eq!(h.counters.snapshot().samples_dropped, 0);
}

#[test]
fn failed_flush_is_counted_and_not_requeued() {
    let counters = Arc::new(EngineCounters::default());
    let sink = Arc::new(MetricSink::new(1000, counters.clone()));
    let flusher = Flusher::new(sink.clone(), Arc::new(UnreachableStore), counters.clone());

    sink.record("exec-1", sample_types::CPU_USAGE, 10.0, "%", Metadata::new());
    sink.record("exec-1", sample_types::CPU_USAGE, 20.0, "%", Metadata::new());

    assert!(matches!(
        flusher.flush(),
        Err(MonitorError::TransientStore(_))
    ));
    assert_eq!(sink.buffered(), 0);
    let stats = counters.snapshot();
    assert_eq!(stats.flush_failures, 1);
    assert_eq!(stats.samples_dropped, 2);
}

#[test]
fn backpressure_flushes_the_full_source() {
    let h = harness();
    let sink = Arc::new(MetricSink::new(10, h.counters.clone()));
    let flusher = Flusher::new(sink.clone(), h.store.clone(), h.counters.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    sink.attach_flush_requests(tx);

    for i in 0..12 {
        sink.record("render-1", sample_types::COMMAND_EXECUTED, i as f64, "ms", Metadata::new());
    }
    sink.record("other", sample_types::CPU_USAGE, 5.0, "%", Metadata::new());

    let source = rx.try_recv().unwrap();
    assert_eq!(source, "render-1");
    assert_eq!(flusher.flush_source(&source).unwrap(), 12);
    assert_eq!(sink.buffered(), 1);
    assert_eq!(h.count_stored(sample_types::COMMAND_EXECUTED), 12.0);
}

#[test]
fn backpressure_with_unreachable_store_keeps_newest() {
    let counters = Arc::new(EngineCounters::default());
    let sink = Arc::new(MetricSink::new(10, counters.clone()));
    let flusher = Flusher::new(sink.clone(), Arc::new(UnreachableStore), counters.clone());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    sink.attach_flush_requests(tx);

    for i in 0..15 {
        sink.record("render-1", sample_types::COMMAND_EXECUTED, i as f64, "ms", Metadata::new());
    }
    assert!(flusher.flush_source("render-1").is_err());

    let kept = sink.take_source("render-1");
    assert_eq!(kept.len(), 10);
    assert_eq!(kept[0].value, 5.0);
    assert_eq!(kept[9].value, 14.0);
    assert_eq!(counters.snapshot().samples_dropped, 5);
}

// ---- Rule evaluation ----

#[test]
fn greater_than_never_triggers_on_equal_value() {
    let h = harness();
    let t = base_time();
    let evaluator = h.evaluator();
    let mut cpu = rule("cpu_usage", ">", 50.0);
    cpu.conditions.aggregation = Aggregation::Max;

    h.insert(sample_types::CPU_USAGE, 50.0, 3, t - Duration::minutes(5));
    assert_eq!(evaluator.evaluate_rule(&cpu, h.store.as_ref(), t).unwrap(), None);

    h.insert(sample_types::CPU_USAGE, 50.5, 1, t - Duration::minutes(1));
    assert_eq!(
        evaluator.evaluate_rule(&cpu, h.store.as_ref(), t).unwrap(),
        Some(50.5)
    );
}

#[test]
fn empty_window_is_skipped_without_error() {
    let h = harness();
    let t = base_time();
    let mut evaluator = h.evaluator();
    let rules = vec![rule("error_rate", ">", 10.0), rule("cpu_usage", ">", 1.0)];

    // Outside the default one hour window.
    h.insert_outcomes(0, 50, t - Duration::hours(2));

    assert!(evaluator.evaluate(&rules, h.store.as_ref(), t).is_empty());
    let stats = h.counters.snapshot();
    assert_eq!(stats.rules_evaluated, 2);
    assert_eq!(stats.evaluation_failures, 0);
}

#[test]
fn timeout_rate_and_custom_field_resolve() {
    let h = harness();
    let t = base_time();
    let evaluator = h.evaluator();

    h.insert_outcomes(3, 0, t - Duration::minutes(10));
    h.insert(sample_types::COMMAND_TIMEOUT, 30_000.0, 1, t - Duration::minutes(10));
    assert_eq!(
        evaluator
            .evaluate_rule(&rule("timeout_rate", ">=", 25.0), h.store.as_ref(), t)
            .unwrap(),
        Some(25.0)
    );

    let mut polygons = Metadata::new();
    polygons.insert("polygons".into(), serde_json::json!(1200));
    h.store
        .batch_insert(&[MetricSample::new("cad-1", "model_export", 1.0, "count", polygons)
            .with_timestamp(t - Duration::minutes(1))])
        .unwrap();
    let mut custom = draft("model_export", ">", 1000.0);
    custom.rule_type = Some("custom".into());
    custom.conditions.field = Some("polygons".into());
    custom.conditions.aggregation = Some("max".into());
    let custom = build_rule(custom).unwrap();
    assert_eq!(
        evaluator.evaluate_rule(&custom, h.store.as_ref(), t).unwrap(),
        Some(1200.0)
    );
}

#[test]
fn failing_rule_does_not_block_others() {
    let h = harness();
    let t = base_time();
    let mut resolvers = ResolverRegistry::with_builtins();
    resolvers.register(Box::new(BrokenResolver));
    let mut evaluator = RuleEvaluator::new(resolvers, h.counters.clone());

    let cpu = rule("cpu_usage", ">", 10.0);
    let errors = rule("error_rate", ">", 10.0);
    h.insert_outcomes(5, 5, t - Duration::minutes(1));

    let breaches = evaluator.evaluate(&[cpu, errors.clone()], h.store.as_ref(), t);
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].rule_id, errors.id);
    assert_eq!(breaches[0].value, 50.0);
    assert_eq!(h.counters.snapshot().evaluation_failures, 1);
}

#[test]
fn disabled_rules_and_silence_period() {
    let h = harness();
    let t = base_time();
    let mut evaluator = h.evaluator();
    let mut silenced = rule("error_rate", ">", 10.0);
    silenced.silence_secs = 300;
    let mut disabled = rule("error_rate", ">", 10.0);
    disabled.enabled = false;
    let rules = vec![silenced, disabled];

    h.insert_outcomes(5, 5, t - Duration::minutes(1));

    assert_eq!(evaluator.evaluate(&rules, h.store.as_ref(), t).len(), 1);
    assert!(evaluator
        .evaluate(&rules, h.store.as_ref(), t + Duration::seconds(60))
        .is_empty());
    assert_eq!(
        evaluator
            .evaluate(&rules, h.store.as_ref(), t + Duration::seconds(300))
            .len(),
        1
    );
}

// ---- Severity and alert lifecycle ----

#[test]
fn severity_boundaries_belong_to_lower_bracket() {
    assert_eq!(severity(15.0, 10.0), AlertLevel::Info);
    assert_eq!(severity(15.0001, 10.0), AlertLevel::Warning);
    assert_eq!(severity(20.0, 10.0), AlertLevel::Warning);
    assert_eq!(severity(20.0001, 10.0), AlertLevel::Critical);
    assert_eq!(severity(30.0, 10.0), AlertLevel::Critical);
    assert_eq!(severity(30.0001, 10.0), AlertLevel::Emergency);
    assert_eq!(severity(2.0, 10.0), AlertLevel::Warning);
    assert_eq!(severity(0.0, 0.0), AlertLevel::Info);
    assert_eq!(severity(0.1, 0.0), AlertLevel::Emergency);
}

#[tokio::test]
async fn trigger_persists_indexes_and_notifies() {
    let h = harness();
    let mut lifecycle = h.lifecycle();
    let t = base_time();
    let rule = rule("error_rate", ">", 10.0);

    let alert = lifecycle
        .trigger(
            &rule,
            TriggerContext {
                source_execution_id: Some("exec-77".into()),
                metadata: Metadata::new(),
            },
            25.0,
            t,
        )
        .await
        .unwrap();

    assert_eq!(alert.level, AlertLevel::Critical);
    assert_eq!(alert.rule_id, rule.id);
    assert_eq!(lifecycle.active_count(), 1);
    let stored = h.store.get(&alert.id).unwrap().unwrap();
    assert_eq!(stored.source_execution_id.as_deref(), Some("exec-77"));
    assert_eq!(stored.triggered_at, t);
    assert_eq!(h.channel.count(), 1);
}

#[tokio::test]
async fn escalates_once_after_delay() {
    let h = harness();
    let mut lifecycle = h.lifecycle();
    let t0 = base_time();
    let rules = vec![escalating_rule(60, AlertLevel::Critical)];

    let alert = lifecycle
        .trigger(&rules[0], TriggerContext::default(), 15.0, t0)
        .await
        .unwrap();
    assert_eq!(alert.level, AlertLevel::Info);
    assert_eq!(h.channel.count(), 1);

    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::seconds(59)).await, 0);
    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::seconds(60)).await, 1);
    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::seconds(120)).await, 0);
    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::hours(5)).await, 0);

    assert_eq!(h.channel.count(), 2);
    let (level, message) = h.channel.last().unwrap();
    assert_eq!(level, AlertLevel::Critical);
    assert!(message.starts_with("[ESCALATED to CRITICAL]"));

    let stored = h.store.get(&alert.id).unwrap().unwrap();
    assert_eq!(stored.level, AlertLevel::Critical);
    assert_eq!(h.counters.snapshot().alerts_escalated, 1);
}

#[tokio::test]
async fn acknowledged_alert_never_escalates() {
    let h = harness();
    let mut lifecycle = h.lifecycle();
    let t0 = base_time();
    let rules = vec![escalating_rule(60, AlertLevel::Critical)];

    let alert = lifecycle
        .trigger(&rules[0], TriggerContext::default(), 15.0, t0)
        .await
        .unwrap();
    assert!(lifecycle
        .acknowledge(&alert.id, "ops", t0 + Duration::seconds(30))
        .unwrap());

    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::seconds(60)).await, 0);
    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::days(1)).await, 0);
    assert_eq!(h.channel.count(), 1);

    // Still active, and a second acknowledgement keeps the first one.
    assert_eq!(lifecycle.active_count(), 1);
    assert!(lifecycle
        .acknowledge(&alert.id, "someone-else", t0 + Duration::seconds(90))
        .unwrap());
    let stored = h.store.get(&alert.id).unwrap().unwrap();
    assert_eq!(stored.acknowledged_at, Some(t0 + Duration::seconds(30)));
    assert_eq!(stored.acknowledged_by.as_deref(), Some("ops"));
}

#[tokio::test]
async fn resolved_alert_leaves_index_and_is_never_escalated() {
    let h = harness();
    let mut lifecycle = h.lifecycle();
    let t0 = base_time();
    let rules = vec![escalating_rule(60, AlertLevel::Emergency)];

    let alert = lifecycle
        .trigger(&rules[0], TriggerContext::default(), 15.0, t0)
        .await
        .unwrap();
    assert!(lifecycle
        .resolve(&alert.id, "ops", Some("restarted the adapter"), t0 + Duration::seconds(10))
        .unwrap());
    assert_eq!(lifecycle.active_count(), 0);

    assert_eq!(lifecycle.check_escalations(&rules, t0 + Duration::seconds(100)).await, 0);
    assert_eq!(h.channel.count(), 1);

    let stored = h.store.get(&alert.id).unwrap().unwrap();
    assert_eq!(stored.resolved_by.as_deref(), Some("ops"));
    assert!(stored.message.ends_with("Resolution: restarted the adapter"));
    assert_eq!(stored.level, AlertLevel::Info);

    // Idempotent resolve; acknowledging a resolved alert is refused.
    assert!(lifecycle
        .resolve(&alert.id, "ops", None, t0 + Duration::seconds(20))
        .unwrap());
    assert_eq!(
        h.store.get(&alert.id).unwrap().unwrap().resolved_at,
        Some(t0 + Duration::seconds(10))
    );
    assert!(!lifecycle
        .acknowledge(&alert.id, "ops", t0 + Duration::seconds(30))
        .unwrap());
}

#[test]
fn unknown_alerts_are_reported_not_errors() {
    let h = harness();
    let mut lifecycle = h.lifecycle();
    assert!(!lifecycle.acknowledge("nope", "ops", base_time()).unwrap());
    assert!(!lifecycle.resolve("nope", "ops", None, base_time()).unwrap());
}

#[tokio::test]
async fn pending_escalation_survives_restart() {
    let h = harness();
    let t0 = base_time();
    let rules = vec![escalating_rule(60, AlertLevel::Warning)];

    let alert = h
        .lifecycle()
        .trigger(&rules[0], TriggerContext::default(), 12.0, t0)
        .await
        .unwrap();

    let mut restarted = h.lifecycle();
    assert_eq!(restarted.load_active().unwrap(), 1);
    assert_eq!(restarted.check_escalations(&rules, t0 + Duration::seconds(61)).await, 1);
    assert_eq!(
        restarted.active_alert(&alert.id).map(|a| a.level),
        Some(AlertLevel::Warning)
    );
}

// ---- Scheduler ticks and retention ----

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let h = harness();
    let (runner, core) = h.runner(Vec::new());

    let held = core.lock().await;
    let first = tokio::spawn({
        let runner = runner.clone();
        async move { runner.tick(base_time()).await }
    });
    while !runner.is_ticking() {
        tokio::task::yield_now().await;
    }

    assert_eq!(runner.tick(base_time()).await, TickOutcome::Skipped);
    drop(held);
    assert!(matches!(first.await.unwrap(), TickOutcome::Completed(_)));
    assert!(!runner.is_ticking());

    let stats = h.counters.snapshot();
    assert_eq!(stats.ticks_run, 1);
    assert_eq!(stats.ticks_skipped, 1);
}

#[tokio::test]
async fn retention_purges_old_resolved_alerts_only() {
    let h = harness();
    let (runner, _core) = h.runner(Vec::new());
    let now = base_time();

    h.insert(sample_types::CPU_USAGE, 1.0, 2, now - Duration::days(31));
    h.insert(sample_types::CPU_USAGE, 1.0, 3, now - Duration::days(1));

    let make = |id: &str, triggered: DateTime<Utc>, resolved: Option<DateTime<Utc>>| Alert {
        id: id.to_string(),
        rule_id: "rule-1".into(),
        rule_name: "errors".into(),
        owner_id: None,
        source_execution_id: None,
        level: AlertLevel::Warning,
        title: "t".into(),
        message: "m".into(),
        value: 1.0,
        threshold: 1.0,
        triggered_at: triggered,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: resolved,
        resolved_by: resolved.map(|_| "ops".to_string()),
        metadata: Metadata::new(),
    };
    h.store
        .create(&make("old-resolved", now - Duration::days(95), Some(now - Duration::days(91))))
        .unwrap();
    h.store
        .create(&make("old-open", now - Duration::days(91), None))
        .unwrap();
    h.store
        .create(&make("recent-resolved", now - Duration::days(89), Some(now - Duration::days(89))))
        .unwrap();

    let report = runner.run_retention(&MonitoringConfig::default(), now);
    assert_eq!(report.samples_purged, 2);
    assert_eq!(report.alerts_purged, 1);
    assert!(h.store.get("old-resolved").unwrap().is_none());
    assert!(h.store.get("old-open").unwrap().is_some());
    assert!(h.store.get("recent-resolved").unwrap().is_some());
}

#[tokio::test]
async fn retention_runs_on_its_own_cadence() {
    let h = harness();
    let (runner, _core) = h.runner(Vec::new());
    let t = base_time();

    let retention_ran = |outcome: TickOutcome| match outcome {
        TickOutcome::Completed(report) => report.retention.is_some(),
        TickOutcome::Skipped => panic!("tick skipped"),
    };
    assert!(retention_ran(runner.tick(t).await));
    assert!(!retention_ran(runner.tick(t + Duration::seconds(30)).await));
    assert!(retention_ran(runner.tick(t + Duration::seconds(3600)).await));
}

#[tokio::test]
async fn tick_evaluates_and_escalates() {
    let h = harness();
    let t0 = base_time();
    let (runner, core) = h.runner(vec![escalating_rule(60, AlertLevel::Critical)]);
    h.insert_outcomes(85, 15, t0 - Duration::minutes(5));

    let TickOutcome::Completed(first) = runner.tick(t0).await else {
        panic!("tick skipped");
    };
    assert_eq!(first.alerts_triggered, 1);
    assert_eq!(first.alerts_escalated, 0);

    // Breach persists, so the next tick raises another alert; the first one
    // is now old enough to escalate.
    let TickOutcome::Completed(second) = runner.tick(t0 + Duration::seconds(60)).await else {
        panic!("tick skipped");
    };
    assert_eq!(second.alerts_triggered, 1);
    assert_eq!(second.alerts_escalated, 1);
    assert_eq!(core.lock().await.lifecycle.active_count(), 2);
}

#[tokio::test]
async fn out_of_range_spans_never_panic_a_tick() {
    let h = harness();
    let t0 = base_time();

    let mut wide_window = rule("error_rate", ">", 10.0);
    wide_window.conditions.timeframe_secs = 10_u64.pow(16);
    let mut endless = escalating_rule(u64::MAX / 2, AlertLevel::Critical);
    endless.silence_secs = u64::MAX;

    let (runner, core) = h.runner(vec![wide_window, endless]);
    h.insert_outcomes(85, 15, t0 - Duration::minutes(1));

    let TickOutcome::Completed(first) = runner.tick(t0).await else {
        panic!("tick skipped");
    };
    assert_eq!(first.alerts_triggered, 1);

    let TickOutcome::Completed(second) = runner.tick(t0 + Duration::seconds(60)).await else {
        panic!("tick skipped");
    };
    assert_eq!(second.alerts_triggered, 0);
    assert_eq!(second.alerts_escalated, 0);
    assert_eq!(core.lock().await.lifecycle.active_count(), 1);
    assert_eq!(h.counters.snapshot().evaluation_failures, 2);

    let config = MonitoringConfig {
        metrics_retention_days: u32::MAX,
        alert_retention_days: u32::MAX,
        ..MonitoringConfig::default()
    };
    assert_eq!(runner.run_retention(&config, t0), RetentionReport::default());
}

#[tokio::test]
async fn slow_delivery_does_not_block_admin_calls() {
    let h = harness();
    let gate = Arc::new(GatedChannel::default());
    let mut registry = ChannelRegistry::new();
    registry.register(gate.clone());
    let engine = Arc::new(
        MonitoringEngine::new(
            MonitoringConfig::default(),
            h.store.clone(),
            h.store.clone(),
            Arc::new(NotificationDispatcher::new(registry)),
        )
        .unwrap(),
    );
    engine.add_alert_rule(draft("error_rate", ">", 10.0)).await.unwrap();
    h.insert_outcomes(85, 15, Utc::now() - Duration::minutes(1));

    let tick = tokio::spawn({
        let engine = engine.clone();
        async move { engine.tick_now().await }
    });
    gate.entered.notified().await;

    let limit = std::time::Duration::from_secs(5);
    let alerts = tokio::time::timeout(limit, engine.get_alerts(AlertQuery::default()))
        .await
        .expect("get_alerts waited on delivery")
        .unwrap();
    assert_eq!(alerts.len(), 1);
    let acked = tokio::time::timeout(limit, engine.acknowledge_alert(&alerts[0].id, "ops"))
        .await
        .expect("acknowledge_alert waited on delivery")
        .unwrap();
    assert!(acked);

    gate.release.notify_one();
    let TickOutcome::Completed(report) = tick.await.unwrap() else {
        panic!("tick skipped");
    };
    assert_eq!(report.alerts_triggered, 1);
    assert_eq!(engine.engine_stats().await.notifications_sent, 1);
}

// ---- End-to-end scenarios ----

#[tokio::test]
async fn scenario_low_error_rate_does_not_trigger() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    engine.add_alert_rule(draft("error_rate", ">", 10.0)).await.unwrap();
    h.insert_outcomes(97, 3, Utc::now() - Duration::minutes(10));

    let TickOutcome::Completed(report) = engine.tick_now().await else {
        panic!("tick skipped");
    };
    assert_eq!(report.breaches, 0);
    assert!(engine.get_alerts(AlertQuery::default()).await.unwrap().is_empty());
    assert_eq!(h.channel.count(), 0);
}

#[tokio::test]
async fn scenario_error_rate_at_half_deviation_is_info() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    engine.add_alert_rule(draft("error_rate", ">", 10.0)).await.unwrap();
    h.insert_outcomes(85, 15, Utc::now() - Duration::minutes(10));

    let TickOutcome::Completed(report) = engine.tick_now().await else {
        panic!("tick skipped");
    };
    assert_eq!(report.alerts_triggered, 1);

    let alerts = engine.get_alerts(AlertQuery::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].value, 15.0);
    assert_eq!(alerts[0].level, AlertLevel::Info);
    assert_eq!(h.channel.count(), 1);
}

#[tokio::test]
async fn scenario_webhook_failure_keeps_alert() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let notify = NotifyConfig {
        max_attempts: 1,
        ..Default::default()
    };
    let dispatcher = Arc::new(NotificationDispatcher::new(
        ChannelRegistry::from_config(&notify).unwrap(),
    ));
    let counters = Arc::new(EngineCounters::default());
    let mut lifecycle = AlertLifecycleManager::new(store.clone(), dispatcher, counters.clone());

    let mut rule = rule("error_rate", ">", 10.0);
    rule.actions.notify = vec![NotifyTarget::new(ChannelConfig::Webhook {
        url: format!("{}/alerts", server.uri()),
    })];

    let alert = lifecycle
        .trigger(&rule, TriggerContext::default(), 15.0, base_time())
        .await
        .unwrap();

    assert!(store.get(&alert.id).unwrap().is_some());
    assert_eq!(lifecycle.active_count(), 1);
    let stats = counters.snapshot();
    assert_eq!(stats.notifications_failed, 1);
    assert_eq!(stats.notifications_sent, 0);
}

// ---- Administrative API ----

#[tokio::test]
async fn add_alert_rule_rejects_invalid_and_duplicate_rules() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());

    let mut missing = draft("error_rate", ">", 10.0);
    missing.conditions.threshold = None;
    assert!(matches!(
        engine.add_alert_rule(missing).await,
        Err(MonitorError::Configuration(_))
    ));

    let mut named = draft("cpu_usage", ">", 90.0);
    named.id = Some("cpu-high".into());
    engine.add_alert_rule(named.clone()).await.unwrap();
    assert!(matches!(
        engine.add_alert_rule(named).await,
        Err(MonitorError::Configuration(_))
    ));
    assert_eq!(engine.list_alert_rules().await.len(), 1);

    assert!(engine.set_alert_rule_enabled("cpu-high", false).await);
    assert!(!engine.list_alert_rules().await[0].enabled);
    assert!(engine.remove_alert_rule("cpu-high").await);
    assert!(!engine.remove_alert_rule("cpu-high").await);
}

#[tokio::test]
async fn get_alerts_filters_by_owner_level_and_limit() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    for (id, owner) in [("r-alice", "alice"), ("r-bob", "bob")] {
        let mut d = draft("error_rate", ">", 10.0);
        d.id = Some(id.into());
        d.owner_id = Some(owner.into());
        engine.add_alert_rule(d).await.unwrap();
    }

    let rules = engine.list_alert_rules().await;
    let mut lifecycle = h.lifecycle();
    let t = base_time();
    lifecycle.trigger(&rules[0], TriggerContext::default(), 15.0, t).await.unwrap();
    lifecycle
        .trigger(&rules[0], TriggerContext::default(), 40.0, t + Duration::seconds(1))
        .await
        .unwrap();
    lifecycle.trigger(&rules[1], TriggerContext::default(), 15.0, t).await.unwrap();

    let alice = AlertQuery {
        user_id: Some("alice".into()),
        ..Default::default()
    };
    assert_eq!(engine.get_alerts(alice.clone()).await.unwrap().len(), 2);

    let emergencies = AlertQuery {
        level: Some(AlertLevel::Emergency),
        ..alice.clone()
    };
    let found = engine.get_alerts(emergencies).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, 40.0);

    let nobody = AlertQuery {
        user_id: Some("carol".into()),
        ..Default::default()
    };
    assert!(engine.get_alerts(nobody).await.unwrap().is_empty());

    let limited = AlertQuery {
        limit: Some(1),
        ..Default::default()
    };
    assert_eq!(engine.get_alerts(limited).await.unwrap().len(), 1);
}

#[tokio::test]
async fn owner_keeps_seeing_alerts_after_rule_removal() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    let mut d = draft("error_rate", ">", 10.0);
    d.owner_id = Some("alice".into());
    let rule = engine.add_alert_rule(d).await.unwrap();

    let fired = h
        .lifecycle()
        .trigger(&rule, TriggerContext::default(), 15.0, base_time())
        .await
        .unwrap();
    assert_eq!(fired.owner_id.as_deref(), Some("alice"));

    assert!(engine.remove_alert_rule(&rule.id).await);
    let alice = AlertQuery {
        user_id: Some("alice".into()),
        ..Default::default()
    };
    let found = engine.get_alerts(alice).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, fired.id);
}

#[tokio::test]
async fn acknowledge_and_resolve_through_engine() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    engine.add_alert_rule(draft("error_rate", ">", 10.0)).await.unwrap();
    h.insert_outcomes(50, 50, Utc::now() - Duration::minutes(1));
    engine.tick_now().await;

    let alert = engine.get_alerts(AlertQuery::default()).await.unwrap().remove(0);
    assert!(engine.acknowledge_alert(&alert.id, "ops").await.unwrap());
    assert!(engine
        .resolve_alert(&alert.id, "ops", Some("fixed"))
        .await
        .unwrap());
    assert!(!engine.acknowledge_alert("missing", "ops").await.unwrap());

    let stored = engine.get_alert(&alert.id).unwrap().unwrap();
    assert!(stored.is_resolved());
    assert_eq!(engine.engine_stats().await.active_alerts, 0);
}

#[tokio::test]
async fn update_config_validates_and_applies() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());

    let err = engine
        .update_config(MonitoringConfigUpdate {
            interval_secs: Some(0),
            max_buffer_size: Some(5),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, MonitorError::Configuration(_)));
    assert_eq!(engine.config(), MonitoringConfig::default());

    let updated = engine
        .update_config(MonitoringConfigUpdate {
            max_buffer_size: Some(5),
            alert_retention_days: Some(30),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(updated.max_buffer_size, 5);
    assert_eq!(engine.config().alert_retention_days, 30);

    // Not started, so nothing serves flush requests: the buffer is capped.
    let recorder = engine.recorder();
    for i in 0..7 {
        recorder.record("exec-1", sample_types::CPU_USAGE, i as f64, "%", Metadata::new());
    }
    let stats = engine.engine_stats().await;
    assert_eq!(stats.buffered_samples, 5);
    assert_eq!(stats.samples_dropped, 2);
}

#[test]
fn monitoring_stats_summarise_executions() {
    let h = harness();
    let now = base_time();
    let at = now - Duration::minutes(30);
    h.insert(sample_types::EXECUTION_COMPLETED, 250.0, 6, at);
    h.insert(sample_types::EXECUTION_COMPLETED, 550.0, 2, at);
    h.insert(sample_types::EXECUTION_FAILED, 1.0, 2, at);
    h.insert(sample_types::EXECUTION_FAILED, 1.0, 5, now - Duration::hours(3));

    let stats = compute_stats(h.store.as_ref(), h.store.as_ref(), TimeRange::Hour, now).unwrap();
    assert_eq!(stats.total_executions, 10);
    assert_eq!(stats.successful_executions, 8);
    assert_eq!(stats.failed_executions, 2);
    assert_eq!(stats.success_rate, 80.0);
    assert_eq!(stats.error_rate, 20.0);
    assert_eq!(stats.avg_execution_time, 325.0);
    assert_eq!(stats.total_alerts, 0);

    let day = compute_stats(h.store.as_ref(), h.store.as_ref(), TimeRange::Day, now).unwrap();
    assert_eq!(day.failed_executions, 7);

    let empty = compute_stats(
        h.store.as_ref(),
        h.store.as_ref(),
        TimeRange::Hour,
        now + Duration::days(10),
    )
    .unwrap();
    assert_eq!(empty.total_executions, 0);
    assert_eq!(empty.success_rate, 0.0);
}

#[tokio::test]
async fn init_and_cleanup_flush_everything() {
    let h = harness();
    let engine = h.engine(MonitoringConfig::default());
    engine.init().await.unwrap();
    engine.init().await.unwrap();
    assert!(engine.is_running());

    let recorder = engine.recorder();
    for _ in 0..3 {
        recorder.record("host", sample_types::CPU_USAGE, 40.0, "%", Metadata::new());
    }
    assert!(engine.publisher().publish(MonitorEvent::Execution(ExecutionEvent {
        execution_id: "exec-1".into(),
        workflow_id: None,
        outcome: ExecutionOutcome::Completed,
        duration_ms: Some(900.0),
    })));

    engine.cleanup().await;
    engine.cleanup().await;
    assert!(!engine.is_running());

    assert_eq!(h.count_stored(sample_types::CPU_USAGE), 3.0);
    assert_eq!(h.count_stored(sample_types::EXECUTION_COMPLETED), 1.0);
}

#[tokio::test]
async fn loaded_alerts_count_as_active_after_init() {
    let h = harness();
    let rule = escalating_rule(60, AlertLevel::Critical);
    h.lifecycle()
        .trigger(&rule, TriggerContext::default(), 15.0, base_time())
        .await
        .unwrap();

    let engine = h.engine(MonitoringConfig::default());
    engine.init().await.unwrap();
    assert_eq!(engine.engine_stats().await.active_alerts, 1);
    engine.cleanup().await;

    let unresolved = h
        .store
        .query(&AlertFilter {
            unresolved_only: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(unresolved.len(), 1);
}
