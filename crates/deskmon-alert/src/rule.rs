//! Turns operator-submitted rule drafts into validated [`AlertRule`]s.

use crate::error::{MonitorError, Result};
use crate::window::MAX_SPAN_SECS;
use deskmon_common::types::{
    Aggregation, AlertRule, AlertRuleDraft, ChannelConfig, CompareOp, MetricKind, RuleConditions,
    RuleType,
};

pub const DEFAULT_TIMEFRAME_SECS: u64 = 3600;

/// Validates a draft and fills in defaults.
///
/// `metric`, `operator` and `threshold` are required. A metric name outside
/// the built-in set is accepted only for `custom` rules. A missing
/// `rule_type` is inferred from the metric.
pub fn build_rule(draft: AlertRuleDraft) -> Result<AlertRule> {
    let conditions = &draft.conditions;

    let metric_name = conditions
        .metric
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| MonitorError::config("conditions.metric is required"))?;
    let operator: CompareOp = conditions
        .operator
        .as_deref()
        .ok_or_else(|| MonitorError::config("conditions.operator is required"))?
        .parse()
        .map_err(MonitorError::Configuration)?;
    let threshold = conditions
        .threshold
        .ok_or_else(|| MonitorError::config("conditions.threshold is required"))?;
    if !threshold.is_finite() {
        return Err(MonitorError::config("conditions.threshold must be finite"));
    }

    let explicit_type = match draft.rule_type.as_deref() {
        Some(t) => Some(t.parse::<RuleType>().map_err(MonitorError::Configuration)?),
        None => None,
    };

    let metric = match (MetricKind::builtin(metric_name), explicit_type) {
        (Some(_), _) if conditions.field.is_some() => {
            return Err(MonitorError::config(format!(
                "conditions.field is only valid for custom metrics, not {metric_name}"
            )));
        }
        (Some(kind), _) => kind,
        (None, Some(RuleType::Custom)) => {
            if let Some(field) = &conditions.field {
                validate_field(field)?;
            }
            MetricKind::Custom {
                sample_type: metric_name.to_string(),
                field: conditions.field.clone(),
            }
        }
        (None, _) => {
            return Err(MonitorError::config(format!(
                "unknown metric '{metric_name}' (custom metrics require rule_type = custom)"
            )));
        }
    };
    let rule_type = explicit_type.unwrap_or_else(|| infer_rule_type(&metric));

    let timeframe_secs = conditions.timeframe_secs.unwrap_or(DEFAULT_TIMEFRAME_SECS);
    if timeframe_secs == 0 {
        return Err(MonitorError::config(
            "conditions.timeframe_secs must be greater than 0",
        ));
    }
    check_span("conditions.timeframe_secs", timeframe_secs)?;
    let aggregation: Aggregation = match conditions.aggregation.as_deref() {
        Some(a) => a.parse().map_err(MonitorError::Configuration)?,
        None => Aggregation::default(),
    };

    for target in &draft.actions.notify {
        validate_channel(&target.channel)?;
    }
    if let Some(policy) = &draft.actions.escalation {
        check_span("actions.escalation.delay_secs", policy.delay_secs)?;
    }
    let silence_secs = draft.silence_secs.unwrap_or(0);
    check_span("silence_secs", silence_secs)?;

    let id = draft
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(deskmon_common::id::next_id);
    let name = if draft.name.trim().is_empty() {
        format!("{metric} {operator} {threshold}")
    } else {
        draft.name
    };

    Ok(AlertRule {
        id,
        name,
        description: draft.description,
        rule_type,
        conditions: RuleConditions {
            metric,
            operator,
            threshold,
            timeframe_secs,
            aggregation,
        },
        actions: draft.actions,
        enabled: draft.enabled.unwrap_or(true),
        owner_id: draft.owner_id,
        silence_secs,
    })
}

fn infer_rule_type(metric: &MetricKind) -> RuleType {
    match metric {
        MetricKind::ErrorRate => RuleType::ErrorRate,
        MetricKind::AvgExecutionTime => RuleType::Performance,
        MetricKind::TimeoutRate => RuleType::Timeout,
        MetricKind::CpuUsage | MetricKind::MemoryUsage => RuleType::ResourceUsage,
        MetricKind::Custom { .. } => RuleType::Custom,
    }
}

/// Metadata field names become JSON paths, so keep them to plain segments.
fn validate_field(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(MonitorError::config(format!(
            "invalid metadata field '{field}'"
        )))
    }
}

fn check_span(name: &str, secs: u64) -> Result<()> {
    if secs > MAX_SPAN_SECS {
        return Err(MonitorError::config(format!(
            "{name} must be at most {MAX_SPAN_SECS}"
        )));
    }
    Ok(())
}

fn validate_channel(channel: &ChannelConfig) -> Result<()> {
    match channel {
        ChannelConfig::Email { recipients } if recipients.is_empty() => Err(
            MonitorError::config("email target needs at least one recipient"),
        ),
        ChannelConfig::Sms { phone_numbers } if phone_numbers.is_empty() => Err(
            MonitorError::config("sms target needs at least one phone number"),
        ),
        ChannelConfig::Webhook { url }
            if !(url.starts_with("http://") || url.starts_with("https://")) =>
        {
            Err(MonitorError::config(format!(
                "webhook url must be http(s): '{url}'"
            )))
        }
        _ => Ok(()),
    }
}
