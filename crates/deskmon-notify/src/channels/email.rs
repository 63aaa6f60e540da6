use crate::config::SmtpConfig;
use crate::error::{NotifyError, Result};
use crate::utils::with_retries;
use crate::NotificationChannel;
use async_trait::async_trait;
use deskmon_common::types::{Alert, ChannelConfig, ChannelKind};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    max_attempts: u32,
}

impl EmailChannel {
    pub fn new(config: &SmtpConfig, max_attempts: u32) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| NotifyError::InvalidConfig(format!("invalid from address: {e}")))?;

        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            max_attempts,
        })
    }

    fn format_body(alert: &Alert) -> String {
        let source_line = alert
            .source_execution_id
            .as_deref()
            .map(|id| format!("\nExecution: {id}"))
            .unwrap_or_default();
        format!(
            "Alert: {level}\nRule: {rule}{source_line}\nValue: {value:.2}\nThreshold: {threshold:.2}\nMessage: {message}\nTriggered: {time}",
            level = alert.level,
            rule = alert.rule_name,
            value = alert.value,
            threshold = alert.threshold,
            message = alert.message,
            time = alert.triggered_at.to_rfc3339(),
        )
    }

    fn build_message(&self, alert: &Alert, recipient: &str) -> Result<Message> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| NotifyError::InvalidConfig(format!("invalid recipient {recipient}: {e}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(super::summary_line(alert))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::format_body(alert))
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }

    async fn send_once(&self, email: &Message) -> Result<()> {
        self.transport
            .send(email.clone())
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, alert: &Alert, target: &ChannelConfig) -> Result<()> {
        let ChannelConfig::Email { recipients } = target else {
            return Err(NotifyError::InvalidConfig(format!(
                "email channel cannot deliver to a {} target",
                target.kind()
            )));
        };

        let mut last_err = None;
        for recipient in recipients {
            let result = match self.build_message(alert, recipient) {
                Ok(email) => {
                    let email = &email;
                    with_retries(ChannelKind::Email, recipient, self.max_attempts, move || {
                        self.send_once(email)
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(recipient = %recipient, error = %e, "Email delivery failed");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
