//! Events emitted by the workflow engine and software adapters, and their
//! translation into metric samples.

use deskmon_common::types::{sample_types, Metadata, MetricSample};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Execution(ExecutionEvent),
    Adapter(AdapterEvent),
    Resource {
        source_id: String,
        #[serde(default)]
        cpu_percent: Option<f64>,
        #[serde(default)]
        memory_percent: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub outcome: ExecutionOutcome,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub adapter_id: String,
    /// The design application the adapter drives.
    pub software: String,
    pub kind: AdapterEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterEventKind {
    Connected,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    CommandExecuted {
        command: String,
        duration_ms: f64,
        outcome: CommandOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Failure {
        #[serde(default)]
        error: Option<String>,
    },
    Timeout,
}

fn meta(pairs: impl IntoIterator<Item = (&'static str, serde_json::Value)>) -> Metadata {
    pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl MonitorEvent {
    /// The samples this event contributes.
    ///
    /// Durations become the sample value of successful outcomes; failures,
    /// cancellations and connection changes are recorded as a count of one.
    pub fn to_samples(&self) -> Vec<MetricSample> {
        match self {
            Self::Execution(e) => {
                let (sample_type, value, unit, mut metadata) = match &e.outcome {
                    ExecutionOutcome::Completed => (
                        sample_types::EXECUTION_COMPLETED,
                        e.duration_ms.unwrap_or(0.0),
                        "ms",
                        Metadata::new(),
                    ),
                    ExecutionOutcome::Failed { error } => (
                        sample_types::EXECUTION_FAILED,
                        1.0,
                        "count",
                        meta([("error", json!(error))]),
                    ),
                    ExecutionOutcome::Cancelled => (
                        sample_types::EXECUTION_CANCELLED,
                        1.0,
                        "count",
                        Metadata::new(),
                    ),
                };
                metadata.extend(meta([
                    ("workflow_id", json!(e.workflow_id)),
                    ("duration_ms", json!(e.duration_ms)),
                ]));
                vec![MetricSample::new(
                    &e.execution_id,
                    sample_type,
                    value,
                    unit,
                    metadata,
                )]
            }
            Self::Adapter(a) => {
                let base = meta([("software", json!(a.software))]);
                let (sample_type, value, unit, extra) = match &a.kind {
                    AdapterEventKind::Connected => {
                        (sample_types::ADAPTER_CONNECTED, 1.0, "count", Metadata::new())
                    }
                    AdapterEventKind::Disconnected { reason } => (
                        sample_types::ADAPTER_DISCONNECTED,
                        1.0,
                        "count",
                        meta([("reason", json!(reason))]),
                    ),
                    AdapterEventKind::CommandExecuted {
                        command,
                        duration_ms,
                        outcome,
                    } => {
                        let mut extra = meta([
                            ("command", json!(command)),
                            ("duration_ms", json!(duration_ms)),
                        ]);
                        match outcome {
                            CommandOutcome::Success => {
                                (sample_types::COMMAND_EXECUTED, *duration_ms, "ms", extra)
                            }
                            CommandOutcome::Failure { error } => {
                                extra.extend(meta([("error", json!(error))]));
                                (sample_types::COMMAND_FAILURE, 1.0, "count", extra)
                            }
                            CommandOutcome::Timeout => {
                                (sample_types::COMMAND_TIMEOUT, *duration_ms, "ms", extra)
                            }
                        }
                    }
                };
                let mut metadata = base;
                metadata.extend(extra);
                vec![MetricSample::new(
                    &a.adapter_id,
                    sample_type,
                    value,
                    unit,
                    metadata,
                )]
            }
            Self::Resource {
                source_id,
                cpu_percent,
                memory_percent,
            } => {
                let mut samples = Vec::new();
                if let Some(cpu) = cpu_percent {
                    samples.push(MetricSample::new(
                        source_id,
                        sample_types::CPU_USAGE,
                        *cpu,
                        "%",
                        Metadata::new(),
                    ));
                }
                if let Some(memory) = memory_percent {
                    samples.push(MetricSample::new(
                        source_id,
                        sample_types::MEMORY_USAGE,
                        *memory,
                        "%",
                        Metadata::new(),
                    ));
                }
                samples
            }
        }
    }
}
