use crate::channels::{ChannelAdapter, OutboundMessage, SendOutcome};
use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::Mailbox,
    transport::smtp::{PoolConfig, authentication::Credentials},
};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    configured: bool,
}

impl EmailChannel {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        EmailChannel {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            configured: smtp_config.is_configured(),
        }
    }

    fn build_message(&self, message: &OutboundMessage) -> anyhow::Result<Message> {
        let from = format!("{} <{}>", self.from_name, self.from_email).parse::<Mailbox>()?;
        let to = message.to.parse::<Mailbox>()?;
        let subject = message.subject.as_deref().unwrap_or("(no subject)");

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(message.body.clone())?;

        Ok(email)
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    async fn send(&self, message: OutboundMessage) -> SendOutcome {
        if !self.configured {
            warn!("SMTP not configured, dropping email to {}", message.to);
            return SendOutcome::failed("SMTP is not configured");
        }

        let email = match self.build_message(&message) {
            Ok(email) => email,
            Err(e) => {
                error!("Failed to build email to {}: {}", message.to, e);
                return SendOutcome::failed(e.to_string());
            }
        };

        match self.transport.send(email).await {
            Ok(response) => {
                info!("Email sent successfully to {}", message.to);
                SendOutcome::sent(response.message().next().map(|s| s.to_string()))
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", message.to, e);
                SendOutcome::failed(e.to_string())
            }
        }
    }
}
