//! Abstract persistence layer.
//!
//! The engine and the management API talk to a [`Store`] trait object. Every
//! read and write is tenant-scoped by account id; nothing here queries across
//! accounts. Production uses [`PgStore`]; tests use [`MemoryStore`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::workflows::actions::{Action, Condition, Delay};
use crate::workflows::jobs::{Job, JobRun, JobStatus};
use crate::workflows::runner::WorkflowDefinition;
use crate::workflows::triggers::Trigger;
use cadence_shared::{Contact, Note, Task};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub order: i32,
    #[serde(default)]
    pub config: Value,
    pub condition: Option<Condition>,
    pub delay: Option<Delay>,
}

/// Partial action update. For `condition` and `delay` the outer `Option`
/// distinguishes "field absent, leave as is" from "field present": an
/// explicit JSON `null` arrives as `Some(None)` and clears the sub-object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionPatch {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub order: Option<i32>,
    pub config: Option<Value>,
    #[serde(default, deserialize_with = "nullable_field")]
    pub condition: Option<Option<Condition>>,
    #[serde(default, deserialize_with = "nullable_field")]
    pub delay: Option<Option<Delay>>,
}

/// Deserialize a present-but-possibly-null field as `Some(Option<T>)`.
/// Absent fields fall back to the `#[serde(default)]` of `None`.
fn nullable_field<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub contact_id: Option<Uuid>,
    pub assigned_user_id: Option<Uuid>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewNote {
    pub body: String,
    pub contact_id: Option<Uuid>,
    pub opportunity_id: Option<Uuid>,
    pub author_id: Uuid,
}

/// Apply a workflow-supplied field map to a contact, honoring the writable
/// allow-list. Keys outside the list are dropped; values of the wrong shape
/// are ignored.
pub(crate) fn apply_contact_fields(contact: &mut Contact, fields: &serde_json::Map<String, Value>) {
    for (key, value) in fields {
        if !cadence_shared::CONTACT_WRITABLE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "firstName" => {
                if let Some(s) = value.as_str() {
                    contact.first_name = s.to_string();
                }
            }
            "lastName" => {
                if let Some(s) = value.as_str() {
                    contact.last_name = s.to_string();
                }
            }
            "email" => contact.email = value.as_str().map(str::to_string),
            "phone" => contact.phone = value.as_str().map(str::to_string),
            "status" => {
                if let Some(s) = value.as_str() {
                    contact.status = s.to_string();
                }
            }
            "tags" => {
                if let Some(tags) = value.as_array() {
                    contact.tags = tags
                        .iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect();
                }
            }
            _ => {}
        }
    }
    contact.updated_at = Some(Utc::now());
}

/// Everything the engine and the management surface need from persistence.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Workflow definitions ────────────────────────────────────────────

    async fn create_workflow(
        &self,
        account_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<WorkflowDefinition>;

    /// Lookup by id alone, ignoring active and deleted state. The runner
    /// uses this: queued jobs keep executing after deactivation or soft
    /// deletion of their workflow.
    async fn get_workflow_any(
        &self,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    /// Soft-deleted workflows are invisible here.
    async fn get_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    async fn list_workflows(
        &self,
        account_id: Uuid,
        is_active: Option<bool>,
    ) -> StoreResult<Vec<WorkflowDefinition>>;

    async fn update_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        patch: WorkflowPatch,
    ) -> StoreResult<WorkflowDefinition>;

    async fn set_workflow_active(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        active: bool,
    ) -> StoreResult<WorkflowDefinition>;

    /// Marks deleted and deactivates. Jobs referencing the workflow survive.
    async fn soft_delete_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> StoreResult<()>;

    // ── Triggers ────────────────────────────────────────────────────────

    async fn add_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        event_type: &str,
        filters: Value,
    ) -> StoreResult<Trigger>;

    async fn remove_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        trigger_id: Uuid,
    ) -> StoreResult<()>;

    async fn workflow_triggers(&self, workflow_id: Uuid) -> StoreResult<Vec<Trigger>>;

    /// Active, non-deleted workflows of this account with at least one
    /// trigger bound to `event_type`, each paired with those triggers.
    async fn workflows_for_event(
        &self,
        account_id: Uuid,
        event_type: &str,
    ) -> StoreResult<Vec<(WorkflowDefinition, Vec<Trigger>)>>;

    // ── Actions ─────────────────────────────────────────────────────────

    async fn add_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        new: NewAction,
    ) -> StoreResult<Action>;

    async fn update_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
        patch: ActionPatch,
    ) -> StoreResult<Action>;

    async fn remove_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
    ) -> StoreResult<()>;

    /// All actions of a workflow ordered ascending, conditions and delays
    /// attached.
    async fn workflow_actions(&self, workflow_id: Uuid) -> StoreResult<Vec<Action>>;

    // ── Jobs and runs ───────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;

    async fn create_job_run(&self, run: &JobRun) -> StoreResult<()>;

    /// The run with the highest attempt number, authoritative for the job's
    /// execution state.
    async fn latest_run(&self, job_id: Uuid) -> StoreResult<Option<JobRun>>;

    async fn mark_job(&self, job_id: Uuid, status: JobStatus) -> StoreResult<()>;

    /// Transition a run. `started_at` is stamped on `Running`, `finished_at`
    /// on terminal states; `error` is recorded verbatim.
    async fn mark_run(
        &self,
        run_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> StoreResult<()>;

    /// Runs for a workflow's jobs, newest first, with the total count.
    async fn list_runs(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        page: u32,
        limit: u32,
    ) -> StoreResult<(Vec<JobRun>, u64)>;

    async fn get_run(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        run_id: Uuid,
    ) -> StoreResult<Option<(JobRun, Job)>>;

    // ── CRM entities the executors touch ────────────────────────────────

    async fn get_contact(&self, account_id: Uuid, contact_id: Uuid)
    -> StoreResult<Option<Contact>>;

    /// Apply a field map to a contact. Keys outside the writable allow-list
    /// are dropped here, server-side, regardless of what the caller sent.
    async fn update_contact_fields(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
        fields: &serde_json::Map<String, Value>,
    ) -> StoreResult<()>;

    async fn create_task(&self, account_id: Uuid, new: NewTask) -> StoreResult<Task>;

    async fn create_note(&self, account_id: Uuid, new: NewNote) -> StoreResult<Note>;

    async fn get_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
    ) -> StoreResult<Option<Uuid>>;

    async fn set_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
        stage_id: Uuid,
    ) -> StoreResult<()>;
}
