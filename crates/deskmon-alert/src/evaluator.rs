use crate::error::{MonitorError, Result};
use crate::resolver::ResolverRegistry;
use crate::stats::EngineCounters;
use crate::window::elapsed;
use chrono::{DateTime, Utc};
use deskmon_common::types::AlertRule;
use deskmon_storage::MetricsStore;
use std::collections::HashMap;
use std::sync::Arc;

/// A rule whose condition held on this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub rule_id: String,
    pub value: f64,
}

/// Resolves every enabled rule's metric and compares it to the threshold.
pub struct RuleEvaluator {
    resolvers: ResolverRegistry,
    last_fired: HashMap<String, DateTime<Utc>>,
    counters: Arc<EngineCounters>,
}

impl RuleEvaluator {
    pub fn new(resolvers: ResolverRegistry, counters: Arc<EngineCounters>) -> Self {
        Self {
            resolvers,
            last_fired: HashMap::new(),
            counters,
        }
    }

    /// Returns the resolved value if the rule's condition is satisfied,
    /// `None` if it is not or the window holds no data.
    pub fn evaluate_rule(
        &self,
        rule: &AlertRule,
        store: &dyn MetricsStore,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let resolved = self
            .resolvers
            .resolve(store, &rule.conditions, now)
            .map_err(|e| match e {
                MonitorError::RuleEvaluation { reason, .. } => MonitorError::RuleEvaluation {
                    rule_id: rule.id.clone(),
                    reason,
                },
                other => other,
            })?;

        let Some(value) = resolved else {
            tracing::debug!(rule_id = %rule.id, metric = %rule.conditions.metric, "No data in window, skipping rule");
            return Ok(None);
        };
        if !value.is_finite() {
            return Err(MonitorError::RuleEvaluation {
                rule_id: rule.id.clone(),
                reason: format!("metric {} resolved to {value}", rule.conditions.metric),
            });
        }

        let cond = &rule.conditions;
        Ok(cond.operator.check(value, cond.threshold).then_some(value))
    }

    /// Evaluates all enabled rules in isolation. A failing rule is logged and
    /// counted; the others still run. Breaches inside a rule's silence
    /// period are suppressed.
    pub fn evaluate(
        &mut self,
        rules: &[AlertRule],
        store: &dyn MetricsStore,
        now: DateTime<Utc>,
    ) -> Vec<Breach> {
        let mut breaches = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            EngineCounters::incr(&self.counters.rules_evaluated);
            let value = match self.evaluate_rule(rule, store, now) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    EngineCounters::incr(&self.counters.evaluation_failures);
                    tracing::error!(rule_id = %rule.id, error = %e, "Rule evaluation failed");
                    continue;
                }
            };

            let suppressed = rule.silence_secs > 0
                && self
                    .last_fired
                    .get(&rule.id)
                    .is_some_and(|last| !elapsed(*last, now, rule.silence_secs));
            if suppressed {
                tracing::debug!(rule_id = %rule.id, "Alert suppressed (silence period)");
                continue;
            }

            self.last_fired.insert(rule.id.clone(), now);
            breaches.push(Breach {
                rule_id: rule.id.clone(),
                value,
            });
        }

        breaches
    }

    /// Drops silence bookkeeping for a removed rule.
    pub fn forget(&mut self, rule_id: &str) {
        self.last_fired.remove(rule_id);
    }
}
