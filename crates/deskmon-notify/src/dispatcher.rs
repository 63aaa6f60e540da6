use crate::error::NotifyError;
use crate::registry::ChannelRegistry;
use deskmon_common::types::{Alert, NotifyTarget};

/// Outcome of fanning one alert out to its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Targets whose `min_level` is above the alert's level.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Fans alerts out to the configured channels.
///
/// Every target is attempted independently: a failing channel is logged and
/// counted in the report but never affects the other targets or the caller.
pub struct NotificationDispatcher {
    registry: ChannelRegistry,
}

impl NotificationDispatcher {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub async fn send(&self, alert: &Alert, targets: &[NotifyTarget]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for target in targets {
            let kind = target.channel.kind();
            if !target.accepts(alert.level) {
                tracing::debug!(
                    alert_id = %alert.id,
                    channel = %kind,
                    level = %alert.level,
                    min_level = %target.min_level,
                    "Notification skipped (below channel minimum level)"
                );
                report.skipped += 1;
                continue;
            }

            let result = match self.registry.get(kind) {
                Some(channel) => channel.send(alert, &target.channel).await,
                None => Err(NotifyError::ChannelUnavailable(kind.to_string())),
            };

            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::error!(
                        alert_id = %alert.id,
                        rule_id = %alert.rule_id,
                        channel = %kind,
                        error = %e,
                        "Failed to send notification"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}
