use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, with_retries, MAX_BODY_LENGTH};
use crate::NotificationChannel;
use async_trait::async_trait;
use chrono::Utc;
use deskmon_common::types::{Alert, ChannelConfig, ChannelKind};
use serde_json::Value;
use std::time::Duration;

/// Posts `{alert, timestamp}` as JSON to the URL named by each target.
pub struct WebhookChannel {
    client: reqwest::Client,
    max_attempts: u32,
}

impl WebhookChannel {
    pub fn new(timeout_secs: u64, max_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_attempts,
        })
    }

    fn payload(alert: &Alert) -> Value {
        serde_json::json!({
            "alert": alert,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    async fn post_once(&self, url: &str, payload: &Value) -> Result<()> {
        let resp = self.client.post(url).json(payload).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = match resp.text().await {
            Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
            Err(e) => format!("[failed to read response body: {e}]"),
        };
        Err(NotifyError::Api {
            service: "webhook".to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, alert: &Alert, target: &ChannelConfig) -> Result<()> {
        let ChannelConfig::Webhook { url } = target else {
            return Err(NotifyError::InvalidConfig(format!(
                "webhook channel cannot deliver to a {} target",
                target.kind()
            )));
        };

        let payload = Self::payload(alert);
        let payload = &payload;
        with_retries(ChannelKind::Webhook, url, self.max_attempts, move || {
            self.post_once(url, payload)
        })
        .await?;

        tracing::debug!(alert_id = %alert.id, url = %url, "Webhook delivered");
        Ok(())
    }
}
