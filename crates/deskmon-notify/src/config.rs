use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for [`NotifyConfig::max_attempts`].
pub const MAX_ATTEMPTS: u32 = 10;

/// Transport settings for the notification channels.
///
/// Webhook delivery needs no settings beyond the per-rule URL, so it is
/// always available; email and SMS are only registered when their section
/// is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub sms: Option<SmsGatewayConfig>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    /// Attempts per delivery, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            smtp: None,
            sms: None,
            webhook_timeout_secs: default_webhook_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(NotifyError::InvalidConfig(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    /// Set to false only for local relays without TLS.
    #[serde(default = "default_smtp_tls")]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsGatewayConfig {
    pub gateway_url: String,
    pub api_key: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_tls() -> bool {
    true
}
