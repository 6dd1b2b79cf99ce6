//! In-process CRM event bus.
//!
//! Every event carries a JSON payload with an `accountId` for tenant scoping.
//! Event names form a closed enumeration — there is no wildcard subscription,
//! so coverage is validated at start-up (see `TriggerMatcher::verify_coverage`).

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Every event the platform emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEvent {
    ContactCreated,
    ContactUpdated,
    ContactDeleted,
    OpportunityCreated,
    OpportunityStageChanged,
    OpportunityClosed,
    MessageReceived,
    MessageSent,
    ConversationCreated,
    WorkflowTriggered,
    JobCompleted,
    JobFailed,
}

impl DomainEvent {
    pub const ALL: [DomainEvent; 12] = [
        DomainEvent::ContactCreated,
        DomainEvent::ContactUpdated,
        DomainEvent::ContactDeleted,
        DomainEvent::OpportunityCreated,
        DomainEvent::OpportunityStageChanged,
        DomainEvent::OpportunityClosed,
        DomainEvent::MessageReceived,
        DomainEvent::MessageSent,
        DomainEvent::ConversationCreated,
        DomainEvent::WorkflowTriggered,
        DomainEvent::JobCompleted,
        DomainEvent::JobFailed,
    ];

    /// Events a workflow trigger may bind to. `job.completed`/`job.failed`
    /// are runner lifecycle notifications, not workflow triggers.
    pub const TRIGGERABLE: [DomainEvent; 10] = [
        DomainEvent::ContactCreated,
        DomainEvent::ContactUpdated,
        DomainEvent::ContactDeleted,
        DomainEvent::OpportunityCreated,
        DomainEvent::OpportunityStageChanged,
        DomainEvent::OpportunityClosed,
        DomainEvent::MessageReceived,
        DomainEvent::MessageSent,
        DomainEvent::ConversationCreated,
        DomainEvent::WorkflowTriggered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactCreated => "contact.created",
            Self::ContactUpdated => "contact.updated",
            Self::ContactDeleted => "contact.deleted",
            Self::OpportunityCreated => "opportunity.created",
            Self::OpportunityStageChanged => "opportunity.stage_changed",
            Self::OpportunityClosed => "opportunity.closed",
            Self::MessageReceived => "message.received",
            Self::MessageSent => "message.sent",
            Self::ConversationCreated => "conversation.created",
            Self::WorkflowTriggered => "workflow.triggered",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscribed handler. Handlers are responsible for their own error
/// handling; the bus never inspects their outcome.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<DomainEvent, Vec<EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, event: DomainEvent, handler: EventHandler) {
        self.handlers
            .write()
            .await
            .entry(event)
            .or_default()
            .push(handler);
    }

    /// Deliver `payload` to every subscriber of `event`. Handlers run as
    /// their own tasks, concurrently; a panicking handler never takes its
    /// siblings or the publisher down with it. `publish` resolves once every
    /// handler has finished. Unsubscribed events are a no-op.
    pub async fn publish(&self, event: DomainEvent, payload: Value) {
        let handlers = {
            let guard = self.handlers.read().await;
            guard.get(&event).cloned().unwrap_or_default()
        };

        debug!("publish {} to {} subscriber(s)", event, handlers.len());

        let tasks: Vec<_> = handlers
            .into_iter()
            .map(|handler| tokio::spawn(handler(payload.clone())))
            .collect();

        for task in tasks {
            if task.await.is_err() {
                warn!("a subscriber for {} panicked", event);
            }
        }
    }

    pub async fn has_subscriber(&self, event: DomainEvent) -> bool {
        self.handlers
            .read()
            .await
            .get(&event)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }
}
