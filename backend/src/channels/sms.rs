use crate::channels::{ChannelAdapter, OutboundMessage, SendOutcome};
use crate::config::SmsConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// SMS delivery through an HTTP provider (Twilio-style message API).
#[derive(Debug, Clone)]
pub struct SmsChannel {
    client: reqwest::Client,
    provider_url: String,
    api_token: String,
    from_number: String,
    configured: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    id: Option<String>,
}

impl SmsChannel {
    pub fn new(sms_config: &SmsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        SmsChannel {
            client,
            provider_url: sms_config.provider_url.clone(),
            api_token: sms_config.api_token.clone(),
            from_number: sms_config.from_number.clone(),
            configured: sms_config.is_configured(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsChannel {
    async fn send(&self, message: OutboundMessage) -> SendOutcome {
        if !self.configured {
            warn!("SMS provider not configured, dropping SMS to {}", message.to);
            return SendOutcome::failed("SMS provider is not configured");
        }

        let payload = serde_json::json!({
            "from": self.from_number,
            "to": message.to,
            "body": message.body,
        });

        let response = self
            .client
            .post(&self.provider_url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!("SMS sent successfully to {}", message.to);
                let external_id = resp
                    .json::<ProviderResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.id);
                SendOutcome::sent(external_id)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!("SMS provider returned {} for {}: {}", status, message.to, body);
                SendOutcome::failed(format!("provider returned {status}: {body}"))
            }
            Err(e) => {
                error!("Failed to send SMS to {}: {}", message.to, e);
                SendOutcome::failed(e.to_string())
            }
        }
    }
}
