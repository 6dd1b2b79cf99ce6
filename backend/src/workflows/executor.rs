//! Action dispatch: routes an action's type tag to its executor.
//!
//! Parameter resolution precedence for every executor: explicit action
//! config field, else the same-named trigger payload field, else the
//! documented default. A missing required parameter is a soft-skip, never a
//! run failure; the exceptions are webhook (missing URL no-ops) and branch
//! (missing expression no-ops).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::{ChannelKind, ChannelRegistry, OutboundMessage};
use crate::events::{DomainEvent, EventBus};
use crate::queue::{EnqueueOptions, WorkflowJobMessage, WorkflowQueue};
use crate::store::{NewNote, NewTask, Store};
use crate::workflows::WorkflowError;
use crate::workflows::actions::{Action, ActionOutcome, ActionType, Delay};
use crate::workflows::expression::{self, EvalContext};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything an executor may need about the step it is running.
pub struct ExecutionContext<'a> {
    pub account_id: Uuid,
    pub job_id: Uuid,
    pub job_run_id: Uuid,
    pub trigger_payload: &'a Value,
    pub action: &'a Action,
}

pub struct ActionExecutor {
    store: Arc<dyn Store>,
    channels: Arc<ChannelRegistry>,
    queue: Arc<dyn WorkflowQueue>,
    bus: EventBus,
    http: reqwest::Client,
    enqueue_defaults: EnqueueOptions,
    template_re: Regex,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        channels: Arc<ChannelRegistry>,
        queue: Arc<dyn WorkflowQueue>,
        bus: EventBus,
        enqueue_defaults: EnqueueOptions,
    ) -> Self {
        Self {
            store,
            channels,
            queue,
            bus,
            http: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
            enqueue_defaults,
            template_re: Regex::new(r"\{\{([^}]+)\}\}").expect("template pattern is valid"),
        }
    }

    /// Execute one action. An unrecognized type tag is a fatal failure for
    /// the job; everything else resolves to a typed outcome.
    pub async fn dispatch(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let kind = ActionType::parse(&ctx.action.kind)
            .ok_or_else(|| WorkflowError::UnknownActionType(ctx.action.kind.clone()))?;

        match kind {
            ActionType::SendEmail => self.send_email(ctx).await,
            ActionType::SendSms => self.send_sms(ctx).await,
            ActionType::CreateTask => self.create_task(ctx).await,
            ActionType::AddNote => self.add_note(ctx).await,
            ActionType::UpdateContact => self.update_contact(ctx).await,
            ActionType::MoveOpportunity => self.move_opportunity(ctx).await,
            ActionType::Webhook => self.webhook(ctx).await,
            ActionType::Wait => self.wait(ctx).await,
            ActionType::Branch => self.branch(ctx).await,
        }
    }

    // ── Parameter resolution helpers ────────────────────────────────────

    /// Config field, else same-named trigger payload field.
    fn resolve<'v>(&self, ctx: &'v ExecutionContext<'_>, key: &str) -> Option<&'v Value> {
        ctx.action
            .config
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| ctx.trigger_payload.get(key).filter(|v| !v.is_null()))
    }

    fn resolve_string(&self, ctx: &ExecutionContext<'_>, key: &str) -> Option<String> {
        self.resolve(ctx, key)
            .map(expression::coerce_string)
            .filter(|s| !s.is_empty())
    }

    fn resolve_uuid(&self, ctx: &ExecutionContext<'_>, key: &str) -> Option<Uuid> {
        self.resolve(ctx, key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Replace `{{path}}` markers with dotted lookups into the trigger
    /// payload. Unresolvable markers are left in place.
    fn interpolate(&self, template: &str, payload: &Value) -> String {
        let mut result = template.to_string();
        for cap in self.template_re.captures_iter(template) {
            let path = cap[1].trim();
            let mut current = payload;
            let mut found = true;
            for part in path.split('.') {
                match current.get(part) {
                    Some(v) => current = v,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                result = result.replace(&cap[0], &expression::coerce_string(current));
            }
        }
        result
    }

    fn skip(&self, ctx: &ExecutionContext<'_>, reason: &'static str) -> ActionOutcome {
        warn!("[job:{}] {}: {}", ctx.job_id, ctx.action.kind, reason);
        ActionOutcome::Skipped { reason }
    }

    // ── Executors ───────────────────────────────────────────────────────

    async fn send_email(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let Some(to) = self.resolve_string(ctx, "to") else {
            return Ok(self.skip(ctx, "missing 'to' config"));
        };
        let subject = self
            .resolve_string(ctx, "subject")
            .map(|s| self.interpolate(&s, ctx.trigger_payload));
        let body = self
            .resolve_string(ctx, "body")
            .map(|b| self.interpolate(&b, ctx.trigger_payload))
            .unwrap_or_default();

        let outcome = self
            .channels
            .send(ChannelKind::Email, OutboundMessage { to: to.clone(), body, subject })
            .await;

        if !outcome.is_sent() {
            return Err(WorkflowError::ChannelSend(
                outcome.error.unwrap_or_else(|| "email send failed".to_string()),
            ));
        }

        info!("[job:{}] send_email → {}", ctx.job_id, to);
        Ok(ActionOutcome::Completed)
    }

    async fn send_sms(&self, ctx: &ExecutionContext<'_>) -> Result<ActionOutcome, WorkflowError> {
        let Some(to) = self.resolve_string(ctx, "to") else {
            return Ok(self.skip(ctx, "missing 'to' config"));
        };
        let body = self
            .resolve_string(ctx, "body")
            .map(|b| self.interpolate(&b, ctx.trigger_payload))
            .unwrap_or_default();

        let outcome = self
            .channels
            .send(ChannelKind::Sms, OutboundMessage { to: to.clone(), body, subject: None })
            .await;

        if !outcome.is_sent() {
            return Err(WorkflowError::ChannelSend(
                outcome.error.unwrap_or_else(|| "sms send failed".to_string()),
            ));
        }

        info!("[job:{}] send_sms → {}", ctx.job_id, to);
        Ok(ActionOutcome::Completed)
    }

    async fn create_task(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let title = self
            .resolve_string(ctx, "title")
            .map(|t| self.interpolate(&t, ctx.trigger_payload))
            .unwrap_or_else(|| "Workflow Task".to_string());
        let contact_id = self.resolve_uuid(ctx, "contactId");
        let assigned_user_id = self.resolve_uuid(ctx, "assignedUserId");
        let due_at = self
            .resolve_string(ctx, "dueDate")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let task = self
            .store
            .create_task(
                ctx.account_id,
                NewTask {
                    title,
                    contact_id,
                    assigned_user_id,
                    due_at,
                },
            )
            .await?;

        info!("[job:{}] create_task → {}", ctx.job_id, task.id);
        Ok(ActionOutcome::Completed)
    }

    async fn add_note(&self, ctx: &ExecutionContext<'_>) -> Result<ActionOutcome, WorkflowError> {
        let Some(body) = self.resolve_string(ctx, "body") else {
            return Ok(self.skip(ctx, "missing 'body' config"));
        };
        let Some(author_id) = self.resolve_uuid(ctx, "authorId") else {
            return Ok(self.skip(ctx, "missing 'authorId' config"));
        };
        let contact_id = self.resolve_uuid(ctx, "contactId");
        let opportunity_id = self.resolve_uuid(ctx, "opportunityId");

        let note = self
            .store
            .create_note(
                ctx.account_id,
                NewNote {
                    body: self.interpolate(&body, ctx.trigger_payload),
                    contact_id,
                    opportunity_id,
                    author_id,
                },
            )
            .await?;

        info!("[job:{}] add_note → {}", ctx.job_id, note.id);
        Ok(ActionOutcome::Completed)
    }

    async fn update_contact(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let Some(contact_id) = self.resolve_uuid(ctx, "contactId") else {
            return Ok(self.skip(ctx, "missing contactId"));
        };
        let Some(fields) = ctx.action.config.get("fields").and_then(Value::as_object) else {
            return Ok(self.skip(ctx, "missing 'fields' config"));
        };

        self.store
            .update_contact_fields(ctx.account_id, contact_id, fields)
            .await?;

        info!("[job:{}] update_contact → {}", ctx.job_id, contact_id);
        Ok(ActionOutcome::Completed)
    }

    async fn move_opportunity(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let Some(opportunity_id) = self.resolve_uuid(ctx, "opportunityId") else {
            return Ok(self.skip(ctx, "missing opportunityId"));
        };
        let Some(to_stage_id) = ctx
            .action
            .config
            .get("stageId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(self.skip(ctx, "missing stageId"));
        };

        let Some(from_stage_id) = self
            .store
            .get_opportunity_stage(ctx.account_id, opportunity_id)
            .await?
        else {
            return Ok(self.skip(ctx, "opportunity not found"));
        };

        self.store
            .set_opportunity_stage(ctx.account_id, opportunity_id, to_stage_id)
            .await?;

        self.bus
            .publish(
                DomainEvent::OpportunityStageChanged,
                json!({
                    "accountId": ctx.account_id,
                    "opportunityId": opportunity_id,
                    "fromStageId": from_stage_id,
                    "toStageId": to_stage_id,
                }),
            )
            .await;

        info!(
            "[job:{}] move_opportunity → {} stage {} → {}",
            ctx.job_id, opportunity_id, from_stage_id, to_stage_id
        );
        Ok(ActionOutcome::Completed)
    }

    /// Best-effort delivery: a transport error or non-2xx status is logged
    /// and never fails the run.
    async fn webhook(&self, ctx: &ExecutionContext<'_>) -> Result<ActionOutcome, WorkflowError> {
        let Some(url) = ctx
            .action
            .config
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
        else {
            return Ok(self.skip(ctx, "missing 'url' config"));
        };

        let mut body = json!({
            "accountId": ctx.account_id,
            "jobId": ctx.job_id,
            "actionId": ctx.action.id,
            "triggerPayload": ctx.trigger_payload,
        });
        if let (Some(body_map), Some(extra)) = (
            body.as_object_mut(),
            ctx.action.config.get("extraData").and_then(Value::as_object),
        ) {
            for (key, value) in extra {
                body_map.insert(key.clone(), value.clone());
            }
        }

        match self.http.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(
                    "[job:{}] webhook → {} OK ({})",
                    ctx.job_id,
                    url,
                    response.status()
                );
            }
            Ok(response) => {
                warn!(
                    "[job:{}] webhook → {} responded {}",
                    ctx.job_id,
                    url,
                    response.status()
                );
            }
            Err(err) => {
                error!("[job:{}] webhook → {} failed: {}", ctx.job_id, url, err);
            }
        }

        Ok(ActionOutcome::Completed)
    }

    /// Schedule a delayed continuation and tell the runner to stop here.
    async fn wait(&self, ctx: &ExecutionContext<'_>) -> Result<ActionOutcome, WorkflowError> {
        let delay_type = ctx
            .action
            .config
            .get("delayType")
            .and_then(Value::as_str)
            .unwrap_or("minutes")
            .to_string();
        let delay_value = ctx
            .action
            .config
            .get("delayValue")
            .and_then(Value::as_i64)
            .unwrap_or(1);

        let delay = Delay {
            delay_type: delay_type.clone(),
            delay_value,
        }
        .as_duration();

        self.queue
            .enqueue(
                WorkflowJobMessage::resume_after(ctx.job_id, ctx.action.id),
                EnqueueOptions {
                    delay,
                    ..self.enqueue_defaults.clone()
                },
            )
            .await
            .map_err(WorkflowError::Queue)?;

        info!(
            "[job:{}] wait: scheduled continuation in {} {} ({:?})",
            ctx.job_id, delay_value, delay_type, delay
        );
        Ok(ActionOutcome::Suspended)
    }

    /// Evaluate the branch expression and report the jump target.
    async fn branch(&self, ctx: &ExecutionContext<'_>) -> Result<ActionOutcome, WorkflowError> {
        let Some(expr) = ctx
            .action
            .config
            .get("expression")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        else {
            return Ok(self.skip(ctx, "missing 'expression' config"));
        };

        let eval_ctx = EvalContext::new(ctx.account_id, ctx.job_id, ctx.trigger_payload.clone());
        let result = expression::evaluate(expr, &eval_ctx);

        let target_key = if result {
            "trueBranchActionId"
        } else {
            "falseBranchActionId"
        };
        let next_action_id = ctx
            .action
            .config
            .get(target_key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        info!(
            "[job:{}] branch: expression={:?} → {} → next={:?}",
            ctx.job_id, expr, result, next_action_id
        );
        Ok(ActionOutcome::Branched { next_action_id })
    }
}
