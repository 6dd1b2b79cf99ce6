//! Postgres-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ActionPatch, NewAction, NewNote, NewTask, Store, StoreError, StoreResult, WorkflowPatch,
    apply_contact_fields,
};
use crate::workflows::actions::{Action, Condition, Delay};
use crate::workflows::jobs::{Job, JobRun, JobStatus};
use crate::workflows::runner::WorkflowDefinition;
use crate::workflows::triggers::Trigger;
use cadence_shared::{Contact, Note, Task};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    account_id: Uuid,
    name: String,
    description: Option<String>,
    is_active: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRow> for WorkflowDefinition {
    fn from(row: WorkflowRow) -> Self {
        WorkflowDefinition {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            description: row.description,
            is_active: row.is_active,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    workflow_id: Uuid,
    event_type: String,
    filters: Value,
    created_at: DateTime<Utc>,
}

impl From<TriggerRow> for Trigger {
    fn from(row: TriggerRow) -> Self {
        Trigger {
            id: row.id,
            workflow_id: row.workflow_id,
            event_type: row.event_type,
            filters: row.filters,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: Uuid,
    workflow_id: Uuid,
    kind: String,
    order: i32,
    config: Value,
    created_at: DateTime<Utc>,
    condition_expression: Option<String>,
    delay_type: Option<String>,
    delay_value: Option<i64>,
}

impl From<ActionRow> for Action {
    fn from(row: ActionRow) -> Self {
        Action {
            id: row.id,
            workflow_id: row.workflow_id,
            kind: row.kind,
            order: row.order,
            config: row.config,
            condition: row
                .condition_expression
                .map(|expression| Condition { expression }),
            delay: match (row.delay_type, row.delay_value) {
                (Some(delay_type), Some(delay_value)) => Some(Delay {
                    delay_type,
                    delay_value,
                }),
                _ => None,
            },
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    account_id: Uuid,
    workflow_id: Uuid,
    payload: Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, StoreError> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Invalid(format!("unknown job status '{}'", row.status)))?;
        Ok(Job {
            id: row.id,
            account_id: row.account_id,
            workflow_id: row.workflow_id,
            payload: row.payload,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRunRow {
    id: Uuid,
    job_id: Uuid,
    attempt: i32,
    status: String,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = StoreError;

    fn try_from(row: JobRunRow) -> Result<Self, StoreError> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Invalid(format!("unknown run status '{}'", row.status)))?;
        Ok(JobRun {
            id: row.id,
            job_id: row.job_id,
            attempt: row.attempt,
            status,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

const ACTION_SELECT: &str = r#"
    SELECT a.id, a.workflow_id, a.kind, a."order", a.config, a.created_at,
           c.expression AS condition_expression,
           d.delay_type, d.delay_value
    FROM actions a
    LEFT JOIN conditions c ON c.action_id = a.id
    LEFT JOIN delays d ON d.action_id = a.id
"#;

impl PgStore {
    async fn require_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> StoreResult<()> {
        let exists: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM workflows WHERE id = $1 AND account_id = $2 AND deleted_at IS NULL",
        )
        .bind(workflow_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        exists
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("Workflow {workflow_id}")))
    }

    async fn fetch_action(&self, action_id: Uuid) -> StoreResult<Action> {
        let row: Option<ActionRow> =
            sqlx::query_as(&format!("{ACTION_SELECT} WHERE a.id = $1"))
                .bind(action_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Action::from)
            .ok_or_else(|| StoreError::NotFound(format!("Action {action_id}")))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_workflow(
        &self,
        account_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<WorkflowDefinition> {
        let row: WorkflowRow = sqlx::query_as(
            "INSERT INTO workflows (id, account_id, name, description)
             VALUES ($1, $2, $3, $4)
             RETURNING id, account_id, name, description, is_active, deleted_at, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_workflow_any(
        &self,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            "SELECT id, account_id, name, description, is_active, deleted_at, created_at, updated_at
             FROM workflows WHERE id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            "SELECT id, account_id, name, description, is_active, deleted_at, created_at, updated_at
             FROM workflows
             WHERE id = $1 AND account_id = $2 AND deleted_at IS NULL",
        )
        .bind(workflow_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_workflows(
        &self,
        account_id: Uuid,
        is_active: Option<bool>,
    ) -> StoreResult<Vec<WorkflowDefinition>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(
            "SELECT id, account_id, name, description, is_active, deleted_at, created_at, updated_at
             FROM workflows
             WHERE account_id = $1 AND deleted_at IS NULL
               AND ($2::boolean IS NULL OR is_active = $2)
             ORDER BY created_at DESC",
        )
        .bind(account_id)
        .bind(is_active)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        patch: WorkflowPatch,
    ) -> StoreResult<WorkflowDefinition> {
        self.require_workflow(account_id, workflow_id).await?;
        let row: WorkflowRow = sqlx::query_as(
            "UPDATE workflows
             SET name = COALESCE($3, name),
                 description = COALESCE($4, description),
                 updated_at = now()
             WHERE id = $1 AND account_id = $2
             RETURNING id, account_id, name, description, is_active, deleted_at, created_at, updated_at",
        )
        .bind(workflow_id)
        .bind(account_id)
        .bind(patch.name)
        .bind(patch.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn set_workflow_active(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        active: bool,
    ) -> StoreResult<WorkflowDefinition> {
        self.require_workflow(account_id, workflow_id).await?;
        let row: WorkflowRow = sqlx::query_as(
            "UPDATE workflows
             SET is_active = $3, updated_at = now()
             WHERE id = $1 AND account_id = $2
             RETURNING id, account_id, name, description, is_active, deleted_at, created_at, updated_at",
        )
        .bind(workflow_id)
        .bind(account_id)
        .bind(active)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn soft_delete_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> StoreResult<()> {
        self.require_workflow(account_id, workflow_id).await?;
        sqlx::query(
            "UPDATE workflows SET deleted_at = now(), is_active = false
             WHERE id = $1 AND account_id = $2",
        )
        .bind(workflow_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        event_type: &str,
        filters: Value,
    ) -> StoreResult<Trigger> {
        self.require_workflow(account_id, workflow_id).await?;
        let row: TriggerRow = sqlx::query_as(
            "INSERT INTO triggers (id, workflow_id, event_type, filters)
             VALUES ($1, $2, $3, $4)
             RETURNING id, workflow_id, event_type, filters, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(workflow_id)
        .bind(event_type)
        .bind(filters)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn remove_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        trigger_id: Uuid,
    ) -> StoreResult<()> {
        self.require_workflow(account_id, workflow_id).await?;
        let result = sqlx::query("DELETE FROM triggers WHERE id = $1 AND workflow_id = $2")
            .bind(trigger_id)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Trigger {trigger_id}")));
        }
        Ok(())
    }

    async fn workflow_triggers(&self, workflow_id: Uuid) -> StoreResult<Vec<Trigger>> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            "SELECT id, workflow_id, event_type, filters, created_at
             FROM triggers WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn workflows_for_event(
        &self,
        account_id: Uuid,
        event_type: &str,
    ) -> StoreResult<Vec<(WorkflowDefinition, Vec<Trigger>)>> {
        let workflows: Vec<WorkflowRow> = sqlx::query_as(
            "SELECT DISTINCT w.id, w.account_id, w.name, w.description, w.is_active,
                    w.deleted_at, w.created_at, w.updated_at
             FROM workflows w
             JOIN triggers t ON t.workflow_id = w.id
             WHERE w.account_id = $1 AND w.is_active AND w.deleted_at IS NULL
               AND t.event_type = $2",
        )
        .bind(account_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(workflows.len());
        for row in workflows {
            let triggers: Vec<TriggerRow> = sqlx::query_as(
                "SELECT id, workflow_id, event_type, filters, created_at
                 FROM triggers WHERE workflow_id = $1 AND event_type = $2",
            )
            .bind(row.id)
            .bind(event_type)
            .fetch_all(&self.pool)
            .await?;
            result.push((row.into(), triggers.into_iter().map(Into::into).collect()));
        }
        Ok(result)
    }

    async fn add_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        new: NewAction,
    ) -> StoreResult<Action> {
        self.require_workflow(account_id, workflow_id).await?;

        let mut tx = self.pool.begin().await?;
        let action_id = Uuid::new_v4();

        sqlx::query(
            r#"INSERT INTO actions (id, workflow_id, kind, "order", config)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(action_id)
        .bind(workflow_id)
        .bind(&new.kind)
        .bind(new.order)
        .bind(&new.config)
        .execute(&mut *tx)
        .await?;

        if let Some(condition) = &new.condition {
            sqlx::query("INSERT INTO conditions (id, action_id, expression) VALUES ($1, $2, $3)")
                .bind(Uuid::new_v4())
                .bind(action_id)
                .bind(&condition.expression)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(delay) = &new.delay {
            sqlx::query(
                "INSERT INTO delays (id, action_id, delay_type, delay_value) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(action_id)
            .bind(&delay.delay_type)
            .bind(delay.delay_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.fetch_action(action_id).await
    }

    async fn update_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
        patch: ActionPatch,
    ) -> StoreResult<Action> {
        self.require_workflow(account_id, workflow_id).await?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"UPDATE actions
               SET kind = COALESCE($3, kind),
                   "order" = COALESCE($4, "order"),
                   config = COALESCE($5, config)
               WHERE id = $1 AND workflow_id = $2"#,
        )
        .bind(action_id)
        .bind(workflow_id)
        .bind(patch.kind)
        .bind(patch.order)
        .bind(patch.config)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Action {action_id}")));
        }

        match patch.condition {
            Some(Some(condition)) => {
                sqlx::query(
                    "INSERT INTO conditions (id, action_id, expression) VALUES ($1, $2, $3)
                     ON CONFLICT (action_id) DO UPDATE SET expression = EXCLUDED.expression",
                )
                .bind(Uuid::new_v4())
                .bind(action_id)
                .bind(&condition.expression)
                .execute(&mut *tx)
                .await?;
            }
            Some(None) => {
                sqlx::query("DELETE FROM conditions WHERE action_id = $1")
                    .bind(action_id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        match patch.delay {
            Some(Some(delay)) => {
                sqlx::query(
                    "INSERT INTO delays (id, action_id, delay_type, delay_value)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (action_id) DO UPDATE
                     SET delay_type = EXCLUDED.delay_type,
                         delay_value = EXCLUDED.delay_value",
                )
                .bind(Uuid::new_v4())
                .bind(action_id)
                .bind(&delay.delay_type)
                .bind(delay.delay_value)
                .execute(&mut *tx)
                .await?;
            }
            Some(None) => {
                sqlx::query("DELETE FROM delays WHERE action_id = $1")
                    .bind(action_id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {}
        }

        tx.commit().await?;
        self.fetch_action(action_id).await
    }

    async fn remove_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
    ) -> StoreResult<()> {
        self.require_workflow(account_id, workflow_id).await?;
        let result = sqlx::query("DELETE FROM actions WHERE id = $1 AND workflow_id = $2")
            .bind(action_id)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Action {action_id}")));
        }
        Ok(())
    }

    async fn workflow_actions(&self, workflow_id: Uuid) -> StoreResult<Vec<Action>> {
        let rows: Vec<ActionRow> = sqlx::query_as(&format!(
            r#"{ACTION_SELECT} WHERE a.workflow_id = $1 ORDER BY a."order" ASC"#
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO jobs (id, account_id, workflow_id, payload, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(job.id)
        .bind(job.account_id)
        .bind(job.workflow_id)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, account_id, workflow_id, payload, status, created_at, updated_at
             FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn create_job_run(&self, run: &JobRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO job_runs (id, job_id, attempt, status, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.job_id)
        .bind(run.attempt)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self, job_id: Uuid) -> StoreResult<Option<JobRun>> {
        let row: Option<JobRunRow> = sqlx::query_as(
            "SELECT id, job_id, attempt, status, error, started_at, finished_at, created_at
             FROM job_runs WHERE job_id = $1
             ORDER BY attempt DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRun::try_from).transpose()
    }

    async fn mark_job(&self, job_id: Uuid, status: JobStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE jobs SET status = $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job {job_id}")));
        }
        Ok(())
    }

    async fn mark_run(
        &self,
        run_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE job_runs
             SET status = $2,
                 error = COALESCE($3, error),
                 started_at = CASE WHEN $2 = 'running' AND started_at IS NULL
                              THEN now() ELSE started_at END,
                 finished_at = CASE WHEN $2 IN ('completed', 'failed')
                               THEN now() ELSE finished_at END
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("JobRun {run_id}")));
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        page: u32,
        limit: u32,
    ) -> StoreResult<(Vec<JobRun>, u64)> {
        let offset = (page.saturating_sub(1) as i64) * limit as i64;

        let rows: Vec<JobRunRow> = sqlx::query_as(
            "SELECT r.id, r.job_id, r.attempt, r.status, r.error,
                    r.started_at, r.finished_at, r.created_at
             FROM job_runs r
             JOIN jobs j ON j.id = r.job_id
             WHERE j.account_id = $1 AND j.workflow_id = $2
             ORDER BY r.created_at DESC
             LIMIT $3 OFFSET $4",
        )
        .bind(account_id)
        .bind(workflow_id)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM job_runs r
             JOIN jobs j ON j.id = r.job_id
             WHERE j.account_id = $1 AND j.workflow_id = $2",
        )
        .bind(account_id)
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;

        let runs = rows
            .into_iter()
            .map(JobRun::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((runs, total as u64))
    }

    async fn get_run(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        run_id: Uuid,
    ) -> StoreResult<Option<(JobRun, Job)>> {
        let row: Option<JobRunRow> = sqlx::query_as(
            "SELECT r.id, r.job_id, r.attempt, r.status, r.error,
                    r.started_at, r.finished_at, r.created_at
             FROM job_runs r
             JOIN jobs j ON j.id = r.job_id
             WHERE r.id = $1 AND j.account_id = $2 AND j.workflow_id = $3",
        )
        .bind(run_id)
        .bind(account_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = JobRun::try_from(row)?;
        let job = self
            .get_job(run.job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Job {}", run.job_id)))?;
        Ok(Some((run, job)))
    }

    async fn get_contact(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
    ) -> StoreResult<Option<Contact>> {
        let contact: Option<Contact> = sqlx::query_as(
            "SELECT id, account_id, first_name, last_name, email, phone, status, tags,
                    company_id, created_at, updated_at
             FROM contacts WHERE id = $1 AND account_id = $2",
        )
        .bind(contact_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    async fn update_contact_fields(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
        fields: &serde_json::Map<String, Value>,
    ) -> StoreResult<()> {
        // Read-modify-write keeps the allow-list logic in one place.
        let mut contact = self
            .get_contact(account_id, contact_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Contact {contact_id}")))?;

        apply_contact_fields(&mut contact, fields);

        sqlx::query(
            "UPDATE contacts
             SET first_name = $3, last_name = $4, email = $5, phone = $6,
                 status = $7, tags = $8, updated_at = now()
             WHERE id = $1 AND account_id = $2",
        )
        .bind(contact_id)
        .bind(account_id)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(&contact.status)
        .bind(&contact.tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_task(&self, account_id: Uuid, new: NewTask) -> StoreResult<Task> {
        let task: Task = sqlx::query_as(
            "INSERT INTO tasks (id, account_id, title, contact_id, assigned_user_id, due_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, account_id, title, contact_id, assigned_user_id, due_at,
                       completed_at, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(&new.title)
        .bind(new.contact_id)
        .bind(new.assigned_user_id)
        .bind(new.due_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(task)
    }

    async fn create_note(&self, account_id: Uuid, new: NewNote) -> StoreResult<Note> {
        let note: Note = sqlx::query_as(
            "INSERT INTO notes (id, account_id, body, contact_id, opportunity_id, author_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, account_id, body, contact_id, opportunity_id, author_id, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(&new.body)
        .bind(new.contact_id)
        .bind(new.opportunity_id)
        .bind(new.author_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(note)
    }

    async fn get_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT stage_id FROM opportunities WHERE id = $1 AND account_id = $2",
        )
        .bind(opportunity_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(stage_id,)| stage_id))
    }

    async fn set_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
        stage_id: Uuid,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE opportunities SET stage_id = $3, updated_at = now()
             WHERE id = $1 AND account_id = $2",
        )
        .bind(opportunity_id)
        .bind(account_id)
        .bind(stage_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Opportunity {opportunity_id}")));
        }
        Ok(())
    }
}
