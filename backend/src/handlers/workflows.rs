//! Workflow management API.
//!
//! Everything here is scoped to the tenant named by the `X-Account-Id`
//! header. The engine itself never goes through these handlers; they exist
//! for builders and run-history views.

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::error::{ApiResult, AppError, validation_error};
use crate::events::DomainEvent;
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::store::{ActionPatch, NewAction, WorkflowPatch};
use crate::workflows::{Action, ActionType, Job, JobRun, Trigger, WorkflowDefinition};

/// Tenant scope taken from the `X-Account-Id` header.
pub struct AccountId(pub Uuid);

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AccountId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-account-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::BadRequest("missing X-Account-Id header".to_string()))?;
        let account_id = Uuid::parse_str(raw)
            .map_err(|_| AppError::BadRequest("invalid X-Account-Id header".to_string()))?;
        Ok(AccountId(account_id))
    }
}

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route(
            "/:id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/:id/activate", post(activate_workflow))
        .route("/:id/deactivate", post(deactivate_workflow))
        .route("/:id/triggers", post(add_trigger))
        .route("/:id/triggers/:trigger_id", axum::routing::delete(remove_trigger))
        .route("/:id/actions", post(add_action))
        .route(
            "/:id/actions/:action_id",
            axum::routing::put(update_action).delete(remove_action),
        )
        .route("/:id/runs", get(list_runs))
        .route("/:id/runs/:run_id", get(get_run))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTrigger {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub filters: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: WorkflowDefinition,
    pub triggers: Vec<Trigger>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: JobRun,
    pub job: Job,
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Query(query): Query<ListWorkflowsQuery>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    let workflows = state
        .store
        .list_workflows(account_id, query.is_active)
        .await?;
    Ok(Json(workflows))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Json(payload): Json<CreateWorkflow>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    if payload.name.trim().is_empty() {
        return Err(validation_error("name", "must not be empty"));
    }
    let workflow = state
        .store
        .create_workflow(account_id, &payload.name, payload.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDetail>> {
    let workflow = state
        .store
        .get_workflow(account_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workflow {id}")))?;
    let triggers = state.store.workflow_triggers(id).await?;
    let actions = state.store.workflow_actions(id).await?;
    Ok(Json(WorkflowDetail {
        workflow,
        triggers,
        actions,
    }))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
    Json(patch): Json<WorkflowPatch>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state.store.update_workflow(account_id, id, patch).await?;
    Ok(Json(workflow))
}

async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.store.soft_delete_workflow(account_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state.store.set_workflow_active(account_id, id, true).await?;
    Ok(Json(workflow))
}

async fn deactivate_workflow(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state
        .store
        .set_workflow_active(account_id, id, false)
        .await?;
    Ok(Json(workflow))
}

async fn add_trigger(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateTrigger>,
) -> ApiResult<(StatusCode, Json<Trigger>)> {
    let Some(event) = DomainEvent::parse(&payload.event_type) else {
        return Err(validation_error("eventType", "unknown event type"));
    };
    if !DomainEvent::TRIGGERABLE.contains(&event) {
        return Err(validation_error("eventType", "event is not triggerable"));
    }
    if !payload.filters.is_object() {
        return Err(validation_error("filters", "must be an object"));
    }

    let trigger = state
        .store
        .add_trigger(account_id, id, event.as_str(), payload.filters)
        .await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn remove_trigger(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path((id, trigger_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.store.remove_trigger(account_id, id, trigger_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_action(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
    Json(payload): Json<NewAction>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    if ActionType::parse(&payload.kind).is_none() {
        return Err(validation_error("type", "unknown action type"));
    }
    let action = state.store.add_action(account_id, id, payload).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

async fn update_action(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path((id, action_id)): Path<(Uuid, Uuid)>,
    Json(patch): Json<ActionPatch>,
) -> ApiResult<Json<Action>> {
    if let Some(kind) = &patch.kind {
        if ActionType::parse(kind).is_none() {
            return Err(validation_error("type", "unknown action type"));
        }
    }
    let action = state
        .store
        .update_action(account_id, id, action_id, patch)
        .await?;
    Ok(Json(action))
}

async fn remove_action(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path((id, action_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.store.remove_action(account_id, id, action_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path(id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<JobRun>>> {
    // 404 for unknown workflows rather than an empty page
    state
        .store
        .get_workflow(account_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Workflow {id}")))?;

    let (runs, total) = state
        .store
        .list_runs(account_id, id, params.page(), params.limit())
        .await?;
    Ok(Json(PaginatedResponse::new(runs, &params, total)))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    AccountId(account_id): AccountId,
    Path((id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<RunDetail>> {
    let (run, job) = state
        .store
        .get_run(account_id, id, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run {run_id}")))?;
    Ok(Json(RunDetail { run, job }))
}
