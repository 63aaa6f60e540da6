use crate::config::SmsGatewayConfig;
use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, with_retries, MAX_BODY_LENGTH};
use crate::NotificationChannel;
use async_trait::async_trait;
use deskmon_common::types::{Alert, ChannelConfig, ChannelKind};
use std::time::Duration;

/// Sends a one-line alert summary through an HTTP SMS gateway.
pub struct SmsChannel {
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
    max_attempts: u32,
}

impl SmsChannel {
    pub fn new(config: &SmsGatewayConfig, max_attempts: u32) -> Result<Self> {
        if config.gateway_url.is_empty() {
            return Err(NotifyError::InvalidConfig("sms gateway_url is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            max_attempts,
        })
    }

    async fn send_once(&self, phone: &str, message: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.gateway_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "to": phone, "message": message }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Api {
            service: "sms".to_string(),
            status: status.as_u16(),
            body: truncate_string(&body, MAX_BODY_LENGTH),
        })
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(&self, alert: &Alert, target: &ChannelConfig) -> Result<()> {
        let ChannelConfig::Sms { phone_numbers } = target else {
            return Err(NotifyError::InvalidConfig(format!(
                "sms channel cannot deliver to a {} target",
                target.kind()
            )));
        };

        let message = super::summary_line(alert);
        let message = message.as_str();
        let mut last_err = None;
        for phone in phone_numbers {
            if let Err(e) =
                with_retries(ChannelKind::Sms, phone, self.max_attempts, move || {
                    self.send_once(phone, message)
                })
                .await
            {
                tracing::error!(phone = %phone, error = %e, "SMS delivery failed");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
