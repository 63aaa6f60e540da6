use deskmon_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    /// A metrics or alert store call failed. Background callers log it and
    /// try again on the next tick.
    #[error("store unavailable: {0}")]
    TransientStore(#[from] StorageError),

    #[error("rule {rule_id} evaluation failed: {reason}")]
    RuleEvaluation { rule_id: String, reason: String },

    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl MonitorError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
