//! Metric resolvers: how a rule's metric name becomes one number.

use crate::error::{MonitorError, Result};
use crate::window::seconds_before;
use chrono::{DateTime, Utc};
use deskmon_common::types::{sample_types, Aggregation, MetricKind, RuleConditions};
use deskmon_storage::{AggregateQuery, MetricsStore};
use std::collections::HashMap;

/// Computes one metric over a rule's trailing window.
///
/// `Ok(None)` means the window holds no data and the rule is skipped.
pub trait MetricResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(
        &self,
        store: &dyn MetricsStore,
        conditions: &RuleConditions,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>>;
}

fn window_start(conditions: &RuleConditions, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    seconds_before(now, conditions.timeframe_secs).ok_or_else(|| MonitorError::RuleEvaluation {
        rule_id: String::new(),
        reason: format!("window of {}s is out of range", conditions.timeframe_secs),
    })
}

/// Percentage of outcome samples that belong to `matching`.
pub struct RateResolver {
    name: &'static str,
    matching: &'static [&'static str],
}

impl MetricResolver for RateResolver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve(
        &self,
        store: &dyn MetricsStore,
        conditions: &RuleConditions,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let from = window_start(conditions, now)?;
        let outcomes = store.aggregate(&AggregateQuery::new(
            sample_types::OUTCOMES,
            Aggregation::Count,
            from,
            now,
        ))?;
        let Some(outcomes) = outcomes.filter(|n| *n > 0.0) else {
            return Ok(None);
        };
        let matching = store
            .aggregate(&AggregateQuery::new(
                self.matching,
                Aggregation::Count,
                from,
                now,
            ))?
            .unwrap_or(0.0);
        // Multiply first: 15 * 100 / 100 is exactly 15.
        Ok(Some(matching * 100.0 / outcomes))
    }
}

/// The rule's aggregation over the values of one sample type.
pub struct SampleResolver {
    name: &'static str,
    sample_type: &'static str,
}

impl MetricResolver for SampleResolver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve(
        &self,
        store: &dyn MetricsStore,
        conditions: &RuleConditions,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let query = AggregateQuery::new(
            &[self.sample_type],
            conditions.aggregation,
            window_start(conditions, now)?,
            now,
        );
        Ok(store.aggregate(&query)?)
    }
}

/// Aggregates an operator-named sample type, or a numeric metadata field of
/// it.
pub struct CustomResolver;

impl MetricResolver for CustomResolver {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn resolve(
        &self,
        store: &dyn MetricsStore,
        conditions: &RuleConditions,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let MetricKind::Custom { sample_type, field } = &conditions.metric else {
            return Err(MonitorError::RuleEvaluation {
                rule_id: String::new(),
                reason: format!("custom resolver cannot read {}", conditions.metric),
            });
        };
        let query = AggregateQuery::new(
            &[sample_type.as_str()],
            conditions.aggregation,
            window_start(conditions, now)?,
            now,
        )
        .with_field(field.clone());
        Ok(store.aggregate(&query)?)
    }
}

/// Resolvers keyed by [`MetricKind::resolver_name`].
pub struct ResolverRegistry {
    resolvers: HashMap<&'static str, Box<dyn MetricResolver>>,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ResolverRegistry {
    pub fn empty() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RateResolver {
            name: "error_rate",
            matching: sample_types::FAILURES,
        }));
        registry.register(Box::new(RateResolver {
            name: "timeout_rate",
            matching: &[sample_types::COMMAND_TIMEOUT],
        }));
        registry.register(Box::new(SampleResolver {
            name: "avg_execution_time",
            sample_type: sample_types::EXECUTION_COMPLETED,
        }));
        registry.register(Box::new(SampleResolver {
            name: "cpu_usage",
            sample_type: sample_types::CPU_USAGE,
        }));
        registry.register(Box::new(SampleResolver {
            name: "memory_usage",
            sample_type: sample_types::MEMORY_USAGE,
        }));
        registry.register(Box::new(CustomResolver));
        registry
    }

    /// Registers a resolver, replacing any with the same name.
    pub fn register(&mut self, resolver: Box<dyn MetricResolver>) {
        self.resolvers.insert(resolver.name(), resolver);
    }

    pub fn resolve(
        &self,
        store: &dyn MetricsStore,
        conditions: &RuleConditions,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let name = conditions.metric.resolver_name();
        let resolver = self
            .resolvers
            .get(name)
            .ok_or_else(|| MonitorError::RuleEvaluation {
                rule_id: String::new(),
                reason: format!("no resolver registered for {name}"),
            })?;
        resolver.resolve(store, conditions, now)
    }
}
