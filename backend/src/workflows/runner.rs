//! Workflow runner: the per-dequeue state machine.
//!
//! Run state transitions: pending → running → {completed | failed | waiting}.
//! `waiting` re-enters `running` on a continuation dequeue. The runner holds
//! no in-memory state between dequeues; everything needed to resume lives in
//! the persisted job, run and action rows plus the continuation marker on the
//! queue message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::events::{DomainEvent, EventBus};
use crate::queue::{EnqueueOptions, ResumePoint, WorkflowJobMessage, WorkflowQueue};
use crate::store::Store;
use crate::workflows::WorkflowError;
use crate::workflows::actions::{Action, ActionOutcome};
use crate::workflows::executor::{ActionExecutor, ExecutionContext};
use crate::workflows::expression::{self, EvalContext};
use crate::workflows::jobs::{JobRun, JobStatus};

/// A named, tenant-scoped automation owning triggers and an ordered action
/// list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct WorkflowRunner {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkflowQueue>,
    bus: EventBus,
    executor: ActionExecutor,
    enqueue_defaults: EnqueueOptions,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkflowQueue>,
        bus: EventBus,
        executor: ActionExecutor,
        enqueue_defaults: EnqueueOptions,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            executor,
            enqueue_defaults,
        }
    }

    /// Process one dequeue. Returning `Err` asks the queue to redeliver;
    /// referential corruption (missing job or workflow) is logged and
    /// dropped instead, since no retry can fix it.
    pub async fn process(&self, message: WorkflowJobMessage) -> Result<(), WorkflowError> {
        let job_id = message.job_id;

        let Some(job) = self.store.get_job(job_id).await? else {
            error!("job {} not found — dropping dequeue", job_id);
            return Ok(());
        };
        let Some(workflow) = self.store.get_workflow_any(job.workflow_id).await? else {
            error!(
                "workflow {} for job {} not found — dropping dequeue",
                job.workflow_id, job_id
            );
            return Ok(());
        };
        let Some(latest) = self.store.latest_run(job_id).await? else {
            error!("no run found for job {} — dropping dequeue", job_id);
            return Ok(());
        };

        // A redelivery after a failure gets a fresh attempt row so the audit
        // trail keeps every attempt.
        let run = if latest.status == JobStatus::Failed {
            let retry = JobRun::new(job_id, latest.attempt + 1);
            self.store.create_job_run(&retry).await?;
            retry
        } else {
            latest
        };

        let actions = self.store.workflow_actions(workflow.id).await?;

        self.store.mark_run(run.id, JobStatus::Running, None).await?;
        self.store.mark_job(job_id, JobStatus::Running).await?;

        // Resume position and whether the first action's pre-execution delay
        // has already been served.
        let (start, delay_served) = match message.resume {
            None => (0, None),
            Some(ResumePoint::AfterAction(after_id)) => (
                action_position(&actions, after_id)
                    .map(|idx| idx + 1)
                    .unwrap_or(0),
                None,
            ),
            Some(ResumePoint::AtAction(at_id)) => (
                action_position(&actions, at_id).unwrap_or(0),
                Some(at_id),
            ),
        };

        // Branch targets can point anywhere, including backwards, so a
        // mis-built workflow could cycle forever. Bound the total number of
        // visited positions and fail the run once it is spent.
        let step_limit = actions.len().saturating_mul(2).max(16);
        let mut steps = 0usize;

        let mut i = start;
        while i < actions.len() {
            steps += 1;
            if steps > step_limit {
                return self
                    .fail(&job, run.id, WorkflowError::BranchCycle(step_limit))
                    .await;
            }
            let action = &actions[i];

            if let Some(condition) = &action.condition {
                let eval_ctx = EvalContext::new(job.account_id, job_id, job.payload.clone());
                if !expression::evaluate(&condition.expression, &eval_ctx) {
                    info!(
                        "[job:{}] action {} ({}) skipped — condition false",
                        job_id, action.id, action.kind
                    );
                    i += 1;
                    continue;
                }
            }

            // A declarative per-action delay suspends the run just like a
            // wait action; the continuation lands back on this exact action
            // with the delay marked as served.
            if let Some(delay) = &action.delay {
                if delay_served != Some(action.id) {
                    self.queue
                        .enqueue(
                            WorkflowJobMessage::resume_at(job_id, action.id),
                            EnqueueOptions {
                                delay: delay.as_duration(),
                                ..self.enqueue_defaults.clone()
                            },
                        )
                        .await
                        .map_err(WorkflowError::Queue)?;
                    info!(
                        "[job:{}] action {} delayed by {:?}",
                        job_id,
                        action.id,
                        delay.as_duration()
                    );
                    return self.suspend(job_id, run.id).await;
                }
            }

            let ctx = ExecutionContext {
                account_id: job.account_id,
                job_id,
                job_run_id: run.id,
                trigger_payload: &job.payload,
                action,
            };

            let outcome = match self.executor.dispatch(&ctx).await {
                Ok(outcome) => outcome,
                Err(err) => return self.fail(&job, run.id, err).await,
            };

            match outcome {
                ActionOutcome::Completed | ActionOutcome::Skipped { .. } => i += 1,
                ActionOutcome::Suspended => {
                    info!("[job:{}] paused at wait action {}", job_id, action.id);
                    return self.suspend(job_id, run.id).await;
                }
                ActionOutcome::Branched { next_action_id } => {
                    let target =
                        next_action_id.and_then(|id| action_position(&actions, id));
                    match target {
                        Some(idx) => {
                            info!("[job:{}] branch → index {}", job_id, idx);
                            i = idx;
                        }
                        // No target or unresolvable id: fall through to the
                        // next sequential action.
                        None => i += 1,
                    }
                }
            }
        }

        self.store
            .mark_run(run.id, JobStatus::Completed, None)
            .await?;
        self.store.mark_job(job_id, JobStatus::Completed).await?;

        self.bus
            .publish(
                DomainEvent::JobCompleted,
                serde_json::json!({
                    "accountId": job.account_id,
                    "jobId": job_id,
                    "jobRunId": run.id,
                }),
            )
            .await;

        info!("[job:{}] completed", job_id);
        Ok(())
    }

    async fn suspend(&self, job_id: Uuid, run_id: Uuid) -> Result<(), WorkflowError> {
        self.store.mark_job(job_id, JobStatus::Waiting).await?;
        self.store.mark_run(run_id, JobStatus::Waiting, None).await?;
        Ok(())
    }

    /// Record the failure and propagate so the queue retries the dequeue.
    async fn fail(
        &self,
        job: &crate::workflows::jobs::Job,
        run_id: Uuid,
        err: WorkflowError,
    ) -> Result<(), WorkflowError> {
        let message = err.to_string();

        self.store.mark_job(job.id, JobStatus::Failed).await?;
        self.store
            .mark_run(run_id, JobStatus::Failed, Some(&message))
            .await?;

        self.bus
            .publish(
                DomainEvent::JobFailed,
                serde_json::json!({
                    "accountId": job.account_id,
                    "jobId": job.id,
                    "jobRunId": run_id,
                    "error": message,
                }),
            )
            .await;

        error!("[job:{}] failed: {}", job.id, message);
        Err(err)
    }
}

/// Branch targets and resume markers address actions by id, never by order.
fn action_position(actions: &[Action], action_id: Uuid) -> Option<usize> {
    actions.iter().position(|a| a.id == action_id)
}
