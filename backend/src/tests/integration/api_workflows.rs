//! Management API tests, driven through the router with `tower::oneshot`.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::AppState;
use crate::events::EventBus;
use crate::handlers::workflows::workflow_routes;
use crate::store::MemoryStore;

fn test_app() -> Router {
    let state = Arc::new(AppState {
        store: Arc::new(MemoryStore::new()),
        bus: EventBus::new(),
    });
    Router::new()
        .nest("/api/v1/workflows", workflow_routes())
        .with_state(state)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    account_id: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(account_id) = account_id {
        builder = builder.header("x-account-id", account_id.to_string());
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_workflow(app: &Router, account_id: Uuid, name: &str) -> Value {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/workflows",
        Some(account_id),
        Some(json!({"name": name})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn create_then_fetch_workflow_detail() {
    let app = test_app();
    let account_id = Uuid::new_v4();

    let created = create_workflow(&app, account_id, "Lead follow-up").await;
    assert_eq!(created["name"], "Lead follow-up");
    assert_eq!(created["is_active"], json!(false));

    let id = created["id"].as_str().unwrap();
    let (status, detail) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{id}"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["id"], created["id"]);
    assert_eq!(detail["triggers"], json!([]));
    assert_eq!(detail["actions"], json!([]));
}

#[tokio::test]
async fn requests_without_account_header_are_rejected() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/v1/workflows", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn blank_workflow_name_fails_validation() {
    let app = test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/workflows",
        Some(Uuid::new_v4()),
        Some(json!({"name": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["name"].is_array());
}

#[tokio::test]
async fn trigger_event_types_are_validated() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();
    let uri = format!("/api/v1/workflows/{id}/triggers");

    let (status, _) = send(
        &app,
        "POST",
        &uri,
        Some(account_id),
        Some(json!({"eventType": "contact.renamed"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // Runner lifecycle events exist but cannot be bound as triggers.
    let (status, _) = send(
        &app,
        "POST",
        &uri,
        Some(account_id),
        Some(json!({"eventType": "job.completed"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, trigger) = send(
        &app,
        "POST",
        &uri,
        Some(account_id),
        Some(json!({"eventType": "contact.created", "filters": {"status": "active"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(trigger["event_type"], "contact.created");
    assert_eq!(trigger["filters"], json!({"status": "active"}));
}

#[tokio::test]
async fn action_types_are_validated() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();
    let uri = format!("/api/v1/workflows/{id}/actions");

    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(account_id),
        Some(json!({"type": "send_pigeon", "order": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, action) = send(
        &app,
        "POST",
        &uri,
        Some(account_id),
        Some(json!({
            "type": "send_email",
            "order": 1,
            "config": {"to": "ada@example.com"},
            "condition": {"expression": "triggerPayload.status equals 'active'"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(action["kind"], "send_email");
    assert_eq!(action["order"], 1);
    assert_eq!(
        action["condition"]["expression"],
        "triggerPayload.status equals 'active'"
    );
}

#[tokio::test]
async fn action_condition_and_delay_can_be_replaced_and_cleared() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();

    let (status, action) = send(
        &app,
        "POST",
        &format!("/api/v1/workflows/{id}/actions"),
        Some(account_id),
        Some(json!({
            "type": "create_task",
            "order": 1,
            "condition": {"expression": "contact.email is_not_empty"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let action_id = action["id"].as_str().unwrap();
    let uri = format!("/api/v1/workflows/{id}/actions/{action_id}");

    // Replace the condition and attach a delay.
    let (status, updated) = send(
        &app,
        "PUT",
        &uri,
        Some(account_id),
        Some(json!({
            "condition": {"expression": "contact.phone is_not_empty"},
            "delay": {"delay_type": "hours", "delay_value": 2},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        updated["condition"]["expression"],
        "contact.phone is_not_empty"
    );
    assert_eq!(updated["delay"]["delay_type"], "hours");
    assert_eq!(updated["delay"]["delay_value"], 2);

    // Omitted fields stay as they are.
    let (status, updated) = send(
        &app,
        "PUT",
        &uri,
        Some(account_id),
        Some(json!({"order": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["order"], 5);
    assert_eq!(
        updated["condition"]["expression"],
        "contact.phone is_not_empty"
    );
    assert_eq!(updated["delay"]["delay_type"], "hours");

    // An explicit null clears the sub-object.
    let (status, updated) = send(
        &app,
        "PUT",
        &uri,
        Some(account_id),
        Some(json!({"condition": null, "delay": null})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["condition"], json!(null));
    assert_eq!(updated["delay"], json!(null));
}

#[tokio::test]
async fn activation_toggles_and_is_reflected_in_filtered_lists() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();

    let (status, activated) = send(
        &app,
        "POST",
        &format!("/api/v1/workflows/{id}/activate"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(activated["is_active"], json!(true));

    let (_, active_list) = send(
        &app,
        "GET",
        "/api/v1/workflows?is_active=true",
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(active_list.as_array().unwrap().len(), 1);

    let (status, deactivated) = send(
        &app,
        "POST",
        &format!("/api/v1/workflows/{id}/deactivate"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deactivated["is_active"], json!(false));

    let (_, active_list) = send(
        &app,
        "GET",
        "/api/v1/workflows?is_active=true",
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(active_list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn soft_deleted_workflows_disappear_from_the_api() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/v1/workflows/{id}"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{id}"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, list) = send(&app, "GET", "/api/v1/workflows", Some(account_id), None).await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn workflows_are_invisible_to_other_accounts() {
    let app = test_app();
    let owner = Uuid::new_v4();
    let workflow = create_workflow(&app, owner, "mine").await;
    let id = workflow["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{id}"),
        Some(Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (_, list) = send(&app, "GET", "/api/v1/workflows", Some(Uuid::new_v4()), None).await;
    assert_eq!(list.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn run_listing_is_paginated_and_scoped_to_known_workflows() {
    let app = test_app();
    let account_id = Uuid::new_v4();

    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{}/runs", Uuid::new_v4()),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();
    let (status, page) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{id}/runs?page=2&limit=10"),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["data"], json!([]));
    assert_eq!(page["meta"]["page"], 2);
    assert_eq!(page["meta"]["limit"], 10);
    assert_eq!(page["meta"]["total"], 0);
    assert_eq!(page["meta"]["total_pages"], 0);
}

#[tokio::test]
async fn unknown_run_lookup_is_a_404() {
    let app = test_app();
    let account_id = Uuid::new_v4();
    let workflow = create_workflow(&app, account_id, "wf").await;
    let id = workflow["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/v1/workflows/{id}/runs/{}", Uuid::new_v4()),
        Some(account_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
