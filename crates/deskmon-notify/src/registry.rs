use crate::channels::email::EmailChannel;
use crate::channels::sms::SmsChannel;
use crate::channels::webhook::WebhookChannel;
use crate::config::NotifyConfig;
use crate::error::Result;
use crate::NotificationChannel;
use deskmon_common::types::ChannelKind;
use std::collections::HashMap;
use std::sync::Arc;

/// The transports available to the dispatcher, one per channel kind.
///
/// # Examples
///
/// ```
/// use deskmon_common::types::ChannelKind;
/// use deskmon_notify::config::NotifyConfig;
/// use deskmon_notify::registry::ChannelRegistry;
///
/// let registry = ChannelRegistry::from_config(&NotifyConfig::default()).unwrap();
/// assert!(registry.has_channel(ChannelKind::Webhook));
/// assert!(!registry.has_channel(ChannelKind::Email));
/// ```
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the webhook transport plus email/SMS when configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new();
        registry.register(Arc::new(WebhookChannel::new(
            config.webhook_timeout_secs,
            config.max_attempts,
        )?));
        if let Some(smtp) = &config.smtp {
            registry.register(Arc::new(EmailChannel::new(smtp, config.max_attempts)?));
        }
        if let Some(sms) = &config.sms {
            registry.register(Arc::new(SmsChannel::new(sms, config.max_attempts)?));
        }
        tracing::info!(channels = ?registry.kinds(), "Notification channels registered");
        Ok(registry)
    }

    /// Registers a transport, replacing any previous one of the same kind.
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Arc<dyn NotificationChannel>> {
        self.channels.get(&kind)
    }

    pub fn has_channel(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<ChannelKind> = self.channels.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}
