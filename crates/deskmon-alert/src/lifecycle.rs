use crate::error::Result;
use crate::stats::EngineCounters;
use crate::window::elapsed;
use chrono::{DateTime, Utc};
use deskmon_common::types::{Alert, AlertLevel, AlertRule, Metadata, NotifyTarget};
use deskmon_notify::dispatcher::{DispatchReport, NotificationDispatcher};
use deskmon_storage::{AlertFilter, AlertStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Extra facts about a breach carried onto the alert.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub source_execution_id: Option<String>,
    pub metadata: Metadata,
}

/// Severity of a breach from its deviation ratio `|value - threshold| / |threshold|`.
///
/// A zero threshold has no meaningful ratio: any non-zero value is treated
/// as an unbounded deviation.
#[allow(clippy::float_cmp)]
pub fn severity(value: f64, threshold: f64) -> AlertLevel {
    if threshold == 0.0 {
        return if value == 0.0 {
            AlertLevel::Info
        } else {
            AlertLevel::Emergency
        };
    }
    AlertLevel::from_deviation((value - threshold).abs() / threshold.abs())
}

/// A persisted alert transition whose notification has not been sent yet.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub alert: Alert,
    pub targets: Vec<NotifyTarget>,
}

/// Sends pending notifications and counts the outcome. Runs outside the
/// alert state lock.
#[derive(Clone)]
pub struct Notifier {
    dispatcher: Arc<NotificationDispatcher>,
    counters: Arc<EngineCounters>,
}

impl Notifier {
    pub async fn deliver(&self, pending: &PendingNotification) -> DispatchReport {
        let report = self
            .dispatcher
            .send(&pending.alert, &pending.targets)
            .await;
        self.counters.record_dispatch(&report);
        report
    }
}

/// Owns the alert state machine and the index of unresolved alerts.
///
/// Every transition is persisted before the in-memory index changes; a
/// store failure leaves the index untouched and is returned to the caller.
pub struct AlertLifecycleManager {
    store: Arc<dyn AlertStore>,
    notifier: Notifier,
    active: HashMap<String, Alert>,
    counters: Arc<EngineCounters>,
}

impl AlertLifecycleManager {
    pub fn new(
        store: Arc<dyn AlertStore>,
        dispatcher: Arc<NotificationDispatcher>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            store,
            notifier: Notifier {
                dispatcher,
                counters: counters.clone(),
            },
            active: HashMap::new(),
            counters,
        }
    }

    /// Rebuilds the active index from the store's unresolved alerts.
    pub fn load_active(&mut self) -> Result<usize> {
        let unresolved = self.store.query(&AlertFilter {
            unresolved_only: true,
            ..Default::default()
        })?;
        self.active = unresolved
            .into_iter()
            .map(|alert| (alert.id.clone(), alert))
            .collect();
        tracing::info!(count = self.active.len(), "Loaded active alerts");
        Ok(self.active.len())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_alert(&self, id: &str) -> Option<&Alert> {
        self.active.get(id)
    }

    pub fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.active.values()
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Creates, persists and indexes a new alert, then notifies the rule's
    /// targets. Notification failures never fail the trigger.
    pub async fn trigger(
        &mut self,
        rule: &AlertRule,
        ctx: TriggerContext,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<Alert> {
        let pending = self.open_alert(rule, ctx, value, now)?;
        self.notifier.deliver(&pending).await;
        Ok(pending.alert)
    }

    /// The state half of [`trigger`](Self::trigger): persists and indexes
    /// the alert and returns the notification still to be sent.
    pub fn open_alert(
        &mut self,
        rule: &AlertRule,
        ctx: TriggerContext,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<PendingNotification> {
        let cond = &rule.conditions;
        let level = severity(value, cond.threshold);
        let alert = Alert {
            id: deskmon_common::id::next_id(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            owner_id: rule.owner_id.clone(),
            source_execution_id: ctx.source_execution_id,
            level,
            title: format!("{}: {} {} {}", rule.name, cond.metric, cond.operator, cond.threshold),
            message: format!(
                "{metric} ({aggregation}, {timeframe}s window) is {value:.2}, threshold {op} {threshold:.2}",
                metric = cond.metric,
                aggregation = cond.aggregation,
                timeframe = cond.timeframe_secs,
                op = cond.operator,
                threshold = cond.threshold,
            ),
            value,
            threshold: cond.threshold,
            triggered_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            metadata: ctx.metadata,
        };

        self.store.create(&alert)?;
        self.active.insert(alert.id.clone(), alert.clone());
        EngineCounters::incr(&self.counters.alerts_triggered);
        tracing::warn!(
            alert_id = %alert.id,
            rule_id = %rule.id,
            level = %level,
            value,
            threshold = cond.threshold,
            "Alert triggered"
        );

        Ok(PendingNotification {
            alert,
            targets: rule.actions.notify.clone(),
        })
    }

    /// Looks an alert up in the index first, then in the store.
    fn find(&self, id: &str) -> Result<Option<Alert>> {
        match self.active.get(id) {
            Some(alert) => Ok(Some(alert.clone())),
            None => Ok(self.store.get(id)?),
        }
    }

    /// Marks an alert acknowledged, which stops escalation. Returns false for
    /// unknown or resolved alerts. Acknowledging twice keeps the first
    /// acknowledgement.
    pub fn acknowledge(&mut self, id: &str, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut alert) = self.find(id)? else {
            return Ok(false);
        };
        if alert.is_resolved() {
            return Ok(false);
        }
        if alert.acknowledged_at.is_some() {
            return Ok(true);
        }

        alert.acknowledged_at = Some(now);
        alert.acknowledged_by = Some(user_id.to_string());
        if !self.store.update(&alert)? {
            self.active.remove(id);
            return Ok(false);
        }
        tracing::info!(alert_id = %id, user_id, "Alert acknowledged");
        self.active.insert(alert.id.clone(), alert);
        Ok(true)
    }

    /// Resolves an alert and drops it from the active index. Resolving an
    /// already-resolved alert succeeds without changes.
    pub fn resolve(
        &mut self,
        id: &str,
        user_id: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut alert) = self.find(id)? else {
            return Ok(false);
        };
        if alert.is_resolved() {
            self.active.remove(id);
            return Ok(true);
        }

        alert.resolved_at = Some(now);
        alert.resolved_by = Some(user_id.to_string());
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            alert.message = format!("{}\nResolution: {note}", alert.message);
        }
        if !self.store.update(&alert)? {
            self.active.remove(id);
            return Ok(false);
        }
        self.active.remove(id);
        tracing::info!(alert_id = %id, user_id, "Alert resolved");
        Ok(true)
    }

    /// Raises unacknowledged alerts that outlived their rule's escalation
    /// delay to the rule's target level and notifies again. An alert already
    /// at or above the target is left alone, so each alert escalates at most
    /// once. Returns the number escalated.
    pub async fn check_escalations(&mut self, rules: &[AlertRule], now: DateTime<Utc>) -> usize {
        let escalated = self.escalate_due(rules, now);
        for pending in &escalated {
            self.notifier.deliver(pending).await;
        }
        escalated.len()
    }

    /// The state half of [`check_escalations`](Self::check_escalations):
    /// persists every due escalation and returns the notifications to send.
    pub fn escalate_due(
        &mut self,
        rules: &[AlertRule],
        now: DateTime<Utc>,
    ) -> Vec<PendingNotification> {
        let rules_by_id: HashMap<&str, &AlertRule> = rules
            .iter()
            .filter(|r| r.actions.escalation.is_some())
            .map(|r| (r.id.as_str(), r))
            .collect();
        if rules_by_id.is_empty() {
            return Vec::new();
        }

        let mut due: Vec<(Alert, &AlertRule)> = Vec::new();
        for alert in self.active.values() {
            let Some(rule) = rules_by_id.get(alert.rule_id.as_str()) else {
                continue;
            };
            let Some(policy) = rule.actions.escalation else {
                continue;
            };
            if alert.acknowledged_at.is_some() || alert.is_resolved() {
                continue;
            }
            if elapsed(alert.triggered_at, now, policy.delay_secs)
                && alert.level < policy.target_level
            {
                let mut escalated = alert.clone();
                escalated.level = policy.target_level;
                escalated.message =
                    format!("[ESCALATED to {}] {}", policy.target_level, alert.message);
                due.push((escalated, *rule));
            }
        }

        let mut escalated = Vec::with_capacity(due.len());
        for (alert, rule) in due {
            match self.store.update(&alert) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(alert_id = %alert.id, "Escalated alert no longer stored, dropping from index");
                    self.active.remove(&alert.id);
                    continue;
                }
                Err(e) => {
                    tracing::error!(alert_id = %alert.id, error = %e, "Failed to persist escalation");
                    continue;
                }
            }

            tracing::warn!(
                alert_id = %alert.id,
                rule_id = %rule.id,
                level = %alert.level,
                "Alert escalated"
            );
            EngineCounters::incr(&self.counters.alerts_escalated);
            self.active.insert(alert.id.clone(), alert.clone());
            escalated.push(PendingNotification {
                alert,
                targets: rule.actions.notify.clone(),
            });
        }
        escalated
    }
}
