//! In-memory [`Store`] used by the test suite.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ActionPatch, NewAction, NewNote, NewTask, Store, StoreError, StoreResult, WorkflowPatch,
    apply_contact_fields,
};
use crate::workflows::actions::Action;
use crate::workflows::jobs::{Job, JobRun, JobStatus};
use crate::workflows::runner::WorkflowDefinition;
use crate::workflows::triggers::Trigger;
use cadence_shared::{Contact, Note, Opportunity, Task};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowDefinition>,
    triggers: HashMap<Uuid, Trigger>,
    actions: HashMap<Uuid, Action>,
    jobs: HashMap<Uuid, Job>,
    runs: HashMap<Uuid, JobRun>,
    contacts: HashMap<Uuid, Contact>,
    opportunities: HashMap<Uuid, Opportunity>,
    tasks: Vec<Task>,
    notes: Vec<Note>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for tests.

    pub async fn insert_contact(&self, contact: Contact) {
        self.inner.write().await.contacts.insert(contact.id, contact);
    }

    pub async fn insert_opportunity(&self, opportunity: Opportunity) {
        self.inner
            .write()
            .await
            .opportunities
            .insert(opportunity.id, opportunity);
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.read().await.tasks.clone()
    }

    pub async fn notes(&self) -> Vec<Note> {
        self.inner.read().await.notes.clone()
    }

    pub async fn contact(&self, contact_id: Uuid) -> Option<Contact> {
        self.inner.read().await.contacts.get(&contact_id).cloned()
    }
}

impl Inner {
    fn visible_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> Option<&WorkflowDefinition> {
        self.workflows
            .get(&workflow_id)
            .filter(|w| w.account_id == account_id && w.deleted_at.is_none())
    }

    fn require_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> StoreResult<()> {
        self.visible_workflow(account_id, workflow_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("Workflow {workflow_id}")))
    }

    /// Mirrors the `UNIQUE (workflow_id, "order")` constraint on the actions
    /// table. `except` skips the action being updated.
    fn require_free_order(
        &self,
        workflow_id: Uuid,
        order: i32,
        except: Option<Uuid>,
    ) -> StoreResult<()> {
        let taken = self.actions.values().any(|a| {
            a.workflow_id == workflow_id && a.order == order && Some(a.id) != except
        });
        if taken {
            return Err(StoreError::Invalid(format!(
                "action order {order} is already used in workflow {workflow_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_workflow(
        &self,
        account_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<WorkflowDefinition> {
        let workflow = WorkflowDefinition {
            id: Uuid::new_v4(),
            account_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            is_active: false,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.inner
            .write()
            .await
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow_any(
        &self,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self.inner.read().await.workflows.get(&workflow_id).cloned())
    }

    async fn get_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self
            .inner
            .read()
            .await
            .visible_workflow(account_id, workflow_id)
            .cloned())
    }

    async fn list_workflows(
        &self,
        account_id: Uuid,
        is_active: Option<bool>,
    ) -> StoreResult<Vec<WorkflowDefinition>> {
        let inner = self.inner.read().await;
        let mut workflows: Vec<_> = inner
            .workflows
            .values()
            .filter(|w| w.account_id == account_id && w.deleted_at.is_none())
            .filter(|w| is_active.is_none_or(|active| w.is_active == active))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn update_workflow(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        patch: WorkflowPatch,
    ) -> StoreResult<WorkflowDefinition> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow {workflow_id}")))?;
        if let Some(name) = patch.name {
            workflow.name = name;
        }
        if let Some(description) = patch.description {
            workflow.description = Some(description);
        }
        workflow.updated_at = Some(Utc::now());
        Ok(workflow.clone())
    }

    async fn set_workflow_active(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        active: bool,
    ) -> StoreResult<WorkflowDefinition> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow {workflow_id}")))?;
        workflow.is_active = active;
        workflow.updated_at = Some(Utc::now());
        Ok(workflow.clone())
    }

    async fn soft_delete_workflow(&self, account_id: Uuid, workflow_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        if let Some(workflow) = inner.workflows.get_mut(&workflow_id) {
            workflow.deleted_at = Some(Utc::now());
            workflow.is_active = false;
        }
        Ok(())
    }

    async fn add_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        event_type: &str,
        filters: Value,
    ) -> StoreResult<Trigger> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        let trigger = Trigger {
            id: Uuid::new_v4(),
            workflow_id,
            event_type: event_type.to_string(),
            filters,
            created_at: Utc::now(),
        };
        inner.triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn remove_trigger(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        trigger_id: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        let found = inner
            .triggers
            .get(&trigger_id)
            .is_some_and(|t| t.workflow_id == workflow_id);
        if !found {
            return Err(StoreError::NotFound(format!("Trigger {trigger_id}")));
        }
        inner.triggers.remove(&trigger_id);
        Ok(())
    }

    async fn workflow_triggers(&self, workflow_id: Uuid) -> StoreResult<Vec<Trigger>> {
        Ok(self
            .inner
            .read()
            .await
            .triggers
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn workflows_for_event(
        &self,
        account_id: Uuid,
        event_type: &str,
    ) -> StoreResult<Vec<(WorkflowDefinition, Vec<Trigger>)>> {
        let inner = self.inner.read().await;
        let mut matches = Vec::new();
        for workflow in inner.workflows.values() {
            if workflow.account_id != account_id
                || !workflow.is_active
                || workflow.deleted_at.is_some()
            {
                continue;
            }
            let triggers: Vec<_> = inner
                .triggers
                .values()
                .filter(|t| t.workflow_id == workflow.id && t.event_type == event_type)
                .cloned()
                .collect();
            if !triggers.is_empty() {
                matches.push((workflow.clone(), triggers));
            }
        }
        Ok(matches)
    }

    async fn add_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        new: NewAction,
    ) -> StoreResult<Action> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        inner.require_free_order(workflow_id, new.order, None)?;
        let action = Action {
            id: Uuid::new_v4(),
            workflow_id,
            kind: new.kind,
            order: new.order,
            config: new.config,
            condition: new.condition,
            delay: new.delay,
            created_at: Utc::now(),
        };
        inner.actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn update_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
        patch: ActionPatch,
    ) -> StoreResult<Action> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        if let Some(order) = patch.order {
            inner.require_free_order(workflow_id, order, Some(action_id))?;
        }
        let action = inner
            .actions
            .get_mut(&action_id)
            .filter(|a| a.workflow_id == workflow_id)
            .ok_or_else(|| StoreError::NotFound(format!("Action {action_id}")))?;
        if let Some(kind) = patch.kind {
            action.kind = kind;
        }
        if let Some(order) = patch.order {
            action.order = order;
        }
        if let Some(config) = patch.config {
            action.config = config;
        }
        if let Some(condition) = patch.condition {
            action.condition = condition;
        }
        if let Some(delay) = patch.delay {
            action.delay = delay;
        }
        Ok(action.clone())
    }

    async fn remove_action(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        action_id: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.require_workflow(account_id, workflow_id)?;
        let found = inner
            .actions
            .get(&action_id)
            .is_some_and(|a| a.workflow_id == workflow_id);
        if !found {
            return Err(StoreError::NotFound(format!("Action {action_id}")));
        }
        inner.actions.remove(&action_id);
        Ok(())
    }

    async fn workflow_actions(&self, workflow_id: Uuid) -> StoreResult<Vec<Action>> {
        let inner = self.inner.read().await;
        let mut actions: Vec<_> = inner
            .actions
            .values()
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.order);
        Ok(actions)
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn create_job_run(&self, run: &JobRun) -> StoreResult<()> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn latest_run(&self, job_id: Uuid) -> StoreResult<Option<JobRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.job_id == job_id)
            .max_by_key(|r| r.attempt)
            .cloned())
    }

    async fn mark_job(&self, job_id: Uuid, status: JobStatus) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {job_id}")))?;
        job.status = status;
        job.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_run(
        &self,
        run_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("JobRun {run_id}")))?;
        run.status = status;
        if status == JobStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
        if let Some(error) = error {
            run.error = Some(error.to_string());
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
        let inner = self.inner.read().await;
        let job_ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.account_id == account_id && j.workflow_id == workflow_id)
            .map(|j| j.id)
            .collect();

        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|r| job_ids.contains(&r.job_id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = runs.len() as u64;
        let offset = (page.saturating_sub(1) * limit) as usize;
        let items = runs.into_iter().skip(offset).take(limit as usize).collect();
        Ok((items, total))
    }

    async fn get_run(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        run_id: Uuid,
    ) -> StoreResult<Option<(JobRun, Job)>> {
        let inner = self.inner.read().await;
        let Some(run) = inner.runs.get(&run_id) else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get(&run.job_id) else {
            return Ok(None);
        };
        if job.account_id != account_id || job.workflow_id != workflow_id {
            return Ok(None);
        }
        Ok(Some((run.clone(), job.clone())))
    }

    async fn get_contact(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
    ) -> StoreResult<Option<Contact>> {
        Ok(self
            .inner
            .read()
            .await
            .contacts
            .get(&contact_id)
            .filter(|c| c.account_id == account_id)
            .cloned())
    }

    async fn update_contact_fields(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
        fields: &serde_json::Map<String, Value>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let contact = inner
            .contacts
            .get_mut(&contact_id)
            .filter(|c| c.account_id == account_id)
            .ok_or_else(|| StoreError::NotFound(format!("Contact {contact_id}")))?;

        apply_contact_fields(contact, fields);
        Ok(())
    }

    async fn create_task(&self, account_id: Uuid, new: NewTask) -> StoreResult<Task> {
        let task = Task {
            id: Uuid::new_v4(),
            account_id,
            title: new.title,
            contact_id: new.contact_id,
            assigned_user_id: new.assigned_user_id,
            due_at: new.due_at,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.inner.write().await.tasks.push(task.clone());
        Ok(task)
    }

    async fn create_note(&self, account_id: Uuid, new: NewNote) -> StoreResult<Note> {
        let note = Note {
            id: Uuid::new_v4(),
            account_id,
            body: new.body,
            contact_id: new.contact_id,
            opportunity_id: new.opportunity_id,
            author_id: new.author_id,
            created_at: Utc::now(),
        };
        self.inner.write().await.notes.push(note.clone());
        Ok(note)
    }

    async fn get_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
    ) -> StoreResult<Option<Uuid>> {
        Ok(self
            .inner
            .read()
            .await
            .opportunities
            .get(&opportunity_id)
            .filter(|o| o.account_id == account_id)
            .map(|o| o.stage_id))
    }

    async fn set_opportunity_stage(
        &self,
        account_id: Uuid,
        opportunity_id: Uuid,
        stage_id: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let opportunity = inner
            .opportunities
            .get_mut(&opportunity_id)
            .filter(|o| o.account_id == account_id)
            .ok_or_else(|| StoreError::NotFound(format!("Opportunity {opportunity_id}")))?;
        opportunity.stage_id = stage_id;
        opportunity.updated_at = Some(Utc::now());
        Ok(())
    }
}
