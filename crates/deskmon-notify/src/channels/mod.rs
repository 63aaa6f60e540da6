pub mod email;
pub mod sms;
pub mod webhook;

use deskmon_common::types::Alert;

/// One-line summary used by the SMS channel and as the email subject suffix.
pub(crate) fn summary_line(alert: &Alert) -> String {
    format!("[deskmon][{}] {}: {}", alert.level, alert.rule_name, alert.title)
}
