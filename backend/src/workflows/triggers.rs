//! Trigger matching: turning domain events into queued workflow jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{DomainEvent, EventBus};
use crate::queue::{EnqueueOptions, WorkflowJobMessage, WorkflowQueue};
use crate::store::Store;
use crate::workflows::expression::coerce_string;
use crate::workflows::jobs::{Job, JobRun};

/// Binds a workflow to one domain event type, optionally narrowed by a
/// conjunctive key→expected-value filter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub event_type: String,
    /// `{}` matches every payload of the event type.
    pub filters: Value,
    pub created_at: DateTime<Utc>,
}

/// Subscribes to every triggerable domain event and enqueues a job for each
/// (workflow, trigger) pair whose filters pass.
pub struct TriggerMatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkflowQueue>,
    bus: EventBus,
    enqueue_defaults: EnqueueOptions,
}

impl TriggerMatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkflowQueue>,
        bus: EventBus,
        enqueue_defaults: EnqueueOptions,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            enqueue_defaults,
        }
    }

    /// Subscribe this matcher to every triggerable event on the bus.
    pub async fn bind(self: Arc<Self>, bus: &EventBus) {
        for event in DomainEvent::TRIGGERABLE {
            let matcher = Arc::clone(&self);
            bus.subscribe(
                event,
                Arc::new(move |payload| {
                    let matcher = Arc::clone(&matcher);
                    Box::pin(async move {
                        matcher.match_and_enqueue(event, payload).await;
                    })
                }),
            )
            .await;
        }
    }

    /// Start-up assertion that no triggerable event is left unmonitored.
    /// Fails fast when a new event type is added without a matcher binding.
    pub async fn verify_coverage(bus: &EventBus) -> anyhow::Result<()> {
        for event in DomainEvent::TRIGGERABLE {
            if !bus.has_subscriber(event).await {
                anyhow::bail!("no trigger matcher bound for event '{event}'");
            }
        }
        Ok(())
    }

    /// Find every (workflow, trigger) pair reacting to this event and fire
    /// each one. A failure on one pair never blocks its siblings.
    pub async fn match_and_enqueue(&self, event: DomainEvent, payload: Value) {
        let Some(account_id) = payload
            .get("accountId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            warn!("event {} carried no accountId, skipping match", event);
            return;
        };

        let pairs = match self
            .store
            .workflows_for_event(account_id, event.as_str())
            .await
        {
            Ok(pairs) => pairs,
            Err(err) => {
                error!("trigger matching query failed for event={}: {}", event, err);
                return;
            }
        };

        for (workflow, triggers) in pairs {
            for trigger in triggers {
                if !filters_match(&trigger.filters, &payload) {
                    debug!(
                        "trigger {} filters did not match event {}",
                        trigger.id, event
                    );
                    continue;
                }
                if let Err(err) = self.fire(account_id, workflow.id, trigger.id, &payload).await {
                    error!(
                        "failed to fire workflow={} trigger={} for event={}: {}",
                        workflow.id, trigger.id, event, err
                    );
                }
            }
        }
    }

    /// Create Job + initial JobRun, enqueue execution and announce the fire.
    async fn fire(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        trigger_id: Uuid,
        payload: &Value,
    ) -> anyhow::Result<()> {
        let job = Job::new(account_id, workflow_id, payload.clone());
        self.store.create_job(&job).await?;

        let run = JobRun::new(job.id, 1);
        self.store.create_job_run(&run).await?;

        self.queue
            .enqueue(
                WorkflowJobMessage::initial(job.id),
                self.enqueue_defaults.clone(),
            )
            .await?;

        self.bus
            .publish(
                DomainEvent::WorkflowTriggered,
                json!({
                    "accountId": account_id,
                    "workflowId": workflow_id,
                    "triggerId": trigger_id,
                    "payload": payload,
                }),
            )
            .await;

        info!(
            "enqueued workflow job={} run={} workflow={}",
            job.id, run.id, workflow_id
        );
        Ok(())
    }
}

/// Every declared filter key must string-coerce equal to the payload value at
/// that key. An empty or non-object filter set always passes.
pub fn filters_match(filters: &Value, payload: &Value) -> bool {
    let Some(filters) = filters.as_object() else {
        return true;
    };
    if filters.is_empty() {
        return true;
    }

    filters.iter().all(|(key, expected)| {
        payload
            .get(key)
            .map(|actual| coerce_string(actual) == coerce_string(expected))
            .unwrap_or(false)
    })
}
