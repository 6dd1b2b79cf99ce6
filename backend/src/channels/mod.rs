// Outbound message channels (email, SMS)
//
// Workflows send through a uniform adapter interface so providers can be
// swapped without touching the executors.

pub mod email;
pub mod sms;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub use email::EmailChannel;
pub use sms::SmsChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Sms,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub body: String,
    /// Email only
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub status: SendStatus,
    pub external_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn sent(external_id: Option<String>) -> Self {
        Self {
            status: SendStatus::Sent,
            external_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            external_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> SendOutcome;
}

/// Routes sends to the adapter for a channel and caps concurrent sends so
/// downstream provider rate limits are respected.
pub struct ChannelRegistry {
    email: Arc<dyn ChannelAdapter>,
    sms: Arc<dyn ChannelAdapter>,
    send_limit: Semaphore,
}

impl ChannelRegistry {
    pub fn new(
        email: Arc<dyn ChannelAdapter>,
        sms: Arc<dyn ChannelAdapter>,
        send_concurrency: usize,
    ) -> Self {
        Self {
            email,
            sms,
            send_limit: Semaphore::new(send_concurrency.max(1)),
        }
    }

    pub async fn send(&self, kind: ChannelKind, message: OutboundMessage) -> SendOutcome {
        let _permit = match self.send_limit.acquire().await {
            Ok(permit) => permit,
            Err(_) => return SendOutcome::failed("channel registry is shut down"),
        };

        let adapter = match kind {
            ChannelKind::Email => &self.email,
            ChannelKind::Sms => &self.sms,
        };

        adapter.send(message).await
    }
}
