use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Free-form JSON attributes attached to samples and alerts.
pub type Metadata = Map<String, Value>;

/// Sample type tags produced by the inbound event translators.
pub mod sample_types {
    pub const EXECUTION_COMPLETED: &str = "execution_completed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";
    pub const COMMAND_EXECUTED: &str = "command_executed";
    pub const COMMAND_FAILURE: &str = "command_failure";
    pub const COMMAND_TIMEOUT: &str = "command_timeout";
    pub const ADAPTER_CONNECTED: &str = "adapter_connected";
    pub const ADAPTER_DISCONNECTED: &str = "adapter_disconnected";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const MEMORY_USAGE: &str = "memory_usage";

    /// Samples that count as a failed execution or command.
    pub const FAILURES: &[&str] = &[EXECUTION_FAILED, COMMAND_FAILURE];

    /// Samples that count as one finished execution or command, whatever
    /// the outcome. Rates are computed against this denominator.
    pub const OUTCOMES: &[&str] = &[
        EXECUTION_COMPLETED,
        EXECUTION_FAILED,
        COMMAND_EXECUTED,
        COMMAND_FAILURE,
        COMMAND_TIMEOUT,
    ];
}

/// A single timestamped numeric observation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: String,
    pub source_id: String,
    pub sample_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MetricSample {
    pub fn new(
        source_id: impl Into<String>,
        sample_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: crate::id::next_id(),
            source_id: source_id.into(),
            sample_type: sample_type.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Alert severity, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use deskmon_common::types::AlertLevel;
///
/// let level: AlertLevel = "critical".parse().unwrap();
/// assert_eq!(level, AlertLevel::Critical);
/// assert_eq!(level.to_string(), "CRITICAL");
/// assert!(AlertLevel::Emergency > AlertLevel::Warning);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    /// Maps a deviation ratio `|value - threshold| / threshold` to a level.
    /// Each boundary belongs to the lower bracket.
    pub fn from_deviation(ratio: f64) -> Self {
        if ratio > 2.0 {
            Self::Emergency
        } else if ratio > 1.0 {
            Self::Critical
        } else if ratio > 0.5 {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            "emergency" => Ok(Self::Emergency),
            _ => Err(format!("unknown alert level: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ErrorRate,
    Performance,
    Timeout,
    ResourceUsage,
    Custom,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ErrorRate => "error_rate",
            Self::Performance => "performance",
            Self::Timeout => "timeout",
            Self::ResourceUsage => "resource_usage",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error_rate" => Ok(Self::ErrorRate),
            "performance" => Ok(Self::Performance),
            "timeout" => Ok(Self::Timeout),
            "resource_usage" => Ok(Self::ResourceUsage),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("unknown rule type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = ">=", alias = "gte")]
    GreaterEqual,
    #[serde(rename = "<=", alias = "lte")]
    LessEqual,
    #[serde(rename = "=", alias = "eq")]
    Equal,
    #[serde(rename = "!=", alias = "ne")]
    NotEqual,
}

impl CompareOp {
    /// `Equal`/`NotEqual` are exact numeric comparisons.
    #[allow(clippy::float_cmp)]
    pub fn check(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => value == threshold,
            Self::NotEqual => value != threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Equal => "=",
            Self::NotEqual => "!=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(Self::GreaterThan),
            "<" | "lt" => Ok(Self::LessThan),
            ">=" | "gte" => Ok(Self::GreaterEqual),
            "<=" | "lte" => Ok(Self::LessEqual),
            "=" | "==" | "eq" => Ok(Self::Equal),
            "!=" | "ne" => Ok(Self::NotEqual),
            other => Err(format!("unknown compare operator: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    #[default]
    Avg,
    Sum,
    Max,
    Min,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Count => "count",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        };
        f.write_str(name)
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "avg" | "average" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            _ => Err(format!("unknown aggregation: {s}")),
        }
    }
}

/// The metric a rule watches. Everything except `Custom` maps to a
/// built-in resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricKind {
    ErrorRate,
    AvgExecutionTime,
    TimeoutRate,
    CpuUsage,
    MemoryUsage,
    Custom {
        sample_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

impl MetricKind {
    /// Parses a built-in metric name. Custom metrics are not recognised here.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "error_rate" => Some(Self::ErrorRate),
            "avg_execution_time" => Some(Self::AvgExecutionTime),
            "timeout_rate" => Some(Self::TimeoutRate),
            "cpu_usage" => Some(Self::CpuUsage),
            "memory_usage" => Some(Self::MemoryUsage),
            _ => None,
        }
    }

    /// Key of the resolver responsible for this metric.
    pub fn resolver_name(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::AvgExecutionTime => "avg_execution_time",
            Self::TimeoutRate => "timeout_rate",
            Self::CpuUsage => "cpu_usage",
            Self::MemoryUsage => "memory_usage",
            Self::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom {
                sample_type,
                field: Some(field),
            } => write!(f, "{sample_type}.{field}"),
            Self::Custom { sample_type, .. } => f.write_str(sample_type),
            other => f.write_str(other.resolver_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub metric: MetricKind,
    pub operator: CompareOp,
    pub threshold: f64,
    /// Length of the trailing aggregation window.
    pub timeframe_secs: u64,
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Webhook,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
            Self::Webhook => write!(f, "webhook"),
        }
    }
}

/// Where a channel delivers an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Email { recipients: Vec<String> },
    Sms { phone_numbers: Vec<String> },
    Webhook { url: String },
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email { .. } => ChannelKind::Email,
            Self::Sms { .. } => ChannelKind::Sms,
            Self::Webhook { .. } => ChannelKind::Webhook,
        }
    }
}

/// A channel configuration plus its minimum-level routing filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyTarget {
    #[serde(default)]
    pub min_level: AlertLevel,
    #[serde(flatten)]
    pub channel: ChannelConfig,
}

impl NotifyTarget {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            min_level: AlertLevel::Info,
            channel,
        }
    }

    pub fn accepts(&self, level: AlertLevel) -> bool {
        level >= self.min_level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub delay_secs: u64,
    pub target_level: AlertLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub notify: Vec<NotifyTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
}

/// A validated threshold rule. Only `enabled` is ever changed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rule_type: RuleType,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    pub enabled: bool,
    pub owner_id: Option<String>,
    /// Minimum seconds between two triggers of this rule; `0` disables
    /// suppression.
    pub silence_secs: u64,
}

/// Unvalidated rule as submitted by an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRuleDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rule_type: Option<String>,
    #[serde(default)]
    pub conditions: ConditionsDraft,
    #[serde(default)]
    pub actions: RuleActions,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub silence_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionsDraft {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub timeframe_secs: Option<u64>,
    #[serde(default)]
    pub aggregation: Option<String>,
    /// Numeric metadata field read by custom metrics instead of `value`.
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Triggered,
    Acknowledged,
    Resolved,
}

/// A stateful record of a rule breach.
///
/// `acknowledged_at` and `resolved_at` are never cleared once set and
/// `level` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    /// Owner of the rule when the alert fired.
    #[serde(default)]
    pub owner_id: Option<String>,
    pub source_execution_id: Option<String>,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Alert {
    pub fn state(&self) -> AlertState {
        if self.resolved_at.is_some() {
            AlertState::Resolved
        } else if self.acknowledged_at.is_some() {
            AlertState::Acknowledged
        } else {
            AlertState::Triggered
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
