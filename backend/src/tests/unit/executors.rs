//! Action executor tests: parameter resolution, template interpolation,
//! soft-skips, the contact field allow-list and webhook delivery.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::events::DomainEvent;
use crate::queue::{ResumePoint, WorkflowJobMessage};
use crate::store::Store;
use crate::tests::fixtures;
use crate::tests::helpers::EngineHarness;
use crate::workflows::jobs::JobStatus;

async fn record_events(
    h: &EngineHarness,
    event: DomainEvent,
) -> Arc<Mutex<Vec<Value>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let writer = sink.clone();
    h.bus
        .subscribe(
            event,
            Arc::new(move |payload| {
                let writer = writer.clone();
                Box::pin(async move {
                    writer.lock().await.push(payload);
                })
            }),
        )
        .await;
    sink
}

/// Run a single-action workflow to completion and return the job id.
async fn run_workflow(h: &EngineHarness, account_id: Uuid, actions: Vec<crate::store::NewAction>, payload: Value) -> Uuid {
    let workflow = fixtures::active_workflow(&h.store, account_id).await;
    for new in actions {
        h.store
            .add_action(account_id, workflow.id, new)
            .await
            .unwrap();
    }
    let job = fixtures::pending_job(&h.store, account_id, workflow.id, payload).await;
    h.runner
        .process(WorkflowJobMessage::initial(job.id))
        .await
        .unwrap();
    job.id
}

#[tokio::test]
async fn update_contact_applies_only_allow_listed_fields() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let contact = fixtures::contact(account_id);
    let contact_id = contact.id;
    h.store.insert_contact(contact).await;

    let job_id = run_workflow(
        &h,
        account_id,
        vec![fixtures::action(
            "update_contact",
            1,
            json!({
                "contactId": contact_id,
                "fields": {
                    "email": "new@example.com",
                    "firstName": "Grace",
                    "status": "vip",
                    "isAdmin": true,
                    "accountId": Uuid::new_v4(),
                },
            }),
        )],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let updated = h.store.contact(contact_id).await.unwrap();
    assert_eq!(updated.email.as_deref(), Some("new@example.com"));
    assert_eq!(updated.first_name, "Grace");
    assert_eq!(updated.status, "vip");
    // Non-writable keys are dropped without touching anything.
    assert_eq!(updated.account_id, account_id);
    assert_eq!(updated.last_name, "Lovelace");
}

#[tokio::test]
async fn update_contact_without_fields_soft_skips() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let contact = fixtures::contact(account_id);
    let contact_id = contact.id;
    h.store.insert_contact(contact).await;

    let job_id = run_workflow(
        &h,
        account_id,
        vec![
            fixtures::action("update_contact", 1, json!({"contactId": contact_id})),
            fixtures::action("create_task", 2, json!({"title": "after"})),
        ],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(h.store.tasks().await.len(), 1);
    assert!(h.store.contact(contact_id).await.unwrap().updated_at.is_none());
}

#[tokio::test]
async fn webhook_posts_execution_metadata_with_extra_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let payload = fixtures::payload(account_id);

    let workflow = fixtures::active_workflow(&h.store, account_id).await;
    let action = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "webhook",
                1,
                json!({
                    "url": format!("{}/hook", server.uri()),
                    "extraData": {"source": "crm", "version": 2},
                }),
            ),
        )
        .await
        .unwrap();
    let job = fixtures::pending_job(&h.store, account_id, workflow.id, payload.clone()).await;
    h.runner
        .process(WorkflowJobMessage::initial(job.id))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["accountId"], json!(account_id));
    assert_eq!(body["jobId"], json!(job.id));
    assert_eq!(body["actionId"], json!(action.id));
    assert_eq!(body["triggerPayload"], payload);
    assert_eq!(body["source"], json!("crm"));
    assert_eq!(body["version"], json!(2));
}

#[tokio::test]
async fn webhook_failures_never_fail_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();

    let job_id = run_workflow(
        &h,
        account_id,
        vec![
            // Non-2xx response.
            fixtures::action("webhook", 1, json!({"url": server.uri()})),
            // Connection refused.
            fixtures::action("webhook", 2, json!({"url": "http://127.0.0.1:9/hook"})),
            fixtures::action("create_task", 3, json!({"title": "after webhooks"})),
        ],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(h.store.tasks().await.len(), 1);
}

#[tokio::test]
async fn wait_schedules_continuation_with_configured_delay() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;
    let wait = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("wait", 1, json!({"delayType": "hours", "delayValue": 2})),
        )
        .await
        .unwrap();
    let job = fixtures::pending_job(
        &h.store,
        account_id,
        workflow.id,
        fixtures::payload(account_id),
    )
    .await;

    h.runner
        .process(WorkflowJobMessage::initial(job.id))
        .await
        .unwrap();

    let mut queued = h.queue.drain().await;
    let (message, options) = queued.remove(0);
    assert_eq!(message.resume, Some(ResumePoint::AfterAction(wait.id)));
    assert_eq!(options.delay, Duration::from_secs(7200));
    assert_eq!(options.attempts, 3);
}

#[tokio::test]
async fn wait_defaults_to_one_minute() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;
    h.store
        .add_action(account_id, workflow.id, fixtures::action("wait", 1, json!({})))
        .await
        .unwrap();
    let job = fixtures::pending_job(
        &h.store,
        account_id,
        workflow.id,
        fixtures::payload(account_id),
    )
    .await;

    h.runner
        .process(WorkflowJobMessage::initial(job.id))
        .await
        .unwrap();

    let (_, options) = h.queue.drain().await.remove(0);
    assert_eq!(options.delay, Duration::from_secs(60));
}

#[tokio::test]
async fn email_templates_interpolate_from_the_trigger_payload() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let mut payload = fixtures::payload(account_id);
    payload["contact"] = json!({"firstName": "Ada"});

    run_workflow(
        &h,
        account_id,
        vec![fixtures::action(
            "send_email",
            1,
            json!({
                "to": "ada@example.com",
                "subject": "Hi {{contact.firstName}}",
                "body": "Status: {{status}}, unknown: {{not.there}}",
            }),
        )],
        payload,
    )
    .await;

    let emails = h.emails.lock().await;
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "ada@example.com");
    assert_eq!(emails[0].subject.as_deref(), Some("Hi Ada"));
    // Unresolvable markers stay verbatim.
    assert_eq!(emails[0].body, "Status: active, unknown: {{not.there}}");
}

#[tokio::test]
async fn missing_recipients_and_authors_soft_skip() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();

    let job_id = run_workflow(
        &h,
        account_id,
        vec![
            fixtures::action("send_email", 1, json!({"body": "no recipient"})),
            fixtures::action("send_sms", 2, json!({"body": "no recipient"})),
            fixtures::action("add_note", 3, json!({"body": "no author"})),
            fixtures::action("create_task", 4, json!({})),
        ],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert!(h.emails.lock().await.is_empty());
    assert!(h.sms.lock().await.is_empty());
    assert!(h.store.notes().await.is_empty());

    // create_task has no required parameters; it fell back to the default
    // title.
    let tasks = h.store.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Workflow Task");
}

#[tokio::test]
async fn executor_parameters_fall_back_to_the_trigger_payload() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let author_id = Uuid::new_v4();

    let mut payload = fixtures::payload(account_id);
    payload["authorId"] = json!(author_id);
    payload["body"] = json!("note body from the event");

    run_workflow(
        &h,
        account_id,
        vec![fixtures::action("add_note", 1, json!({}))],
        payload,
    )
    .await;

    let notes = h.store.notes().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].author_id, author_id);
    assert_eq!(notes[0].body, "note body from the event");
}

#[tokio::test]
async fn move_opportunity_changes_stage_and_announces_it() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let from_stage = Uuid::new_v4();
    let to_stage = Uuid::new_v4();

    let opportunity = fixtures::opportunity(account_id, from_stage);
    let opportunity_id = opportunity.id;
    h.store.insert_opportunity(opportunity).await;

    let changes = record_events(&h, DomainEvent::OpportunityStageChanged).await;

    run_workflow(
        &h,
        account_id,
        vec![fixtures::action(
            "move_opportunity",
            1,
            json!({"opportunityId": opportunity_id, "stageId": to_stage}),
        )],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store
            .get_opportunity_stage(account_id, opportunity_id)
            .await
            .unwrap(),
        Some(to_stage)
    );

    let changes = changes.lock().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["opportunityId"], json!(opportunity_id));
    assert_eq!(changes[0]["fromStageId"], json!(from_stage));
    assert_eq!(changes[0]["toStageId"], json!(to_stage));
}

#[tokio::test]
async fn move_opportunity_on_unknown_opportunity_soft_skips() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();

    let job_id = run_workflow(
        &h,
        account_id,
        vec![fixtures::action(
            "move_opportunity",
            1,
            json!({"opportunityId": Uuid::new_v4(), "stageId": Uuid::new_v4()}),
        )],
        fixtures::payload(account_id),
    )
    .await;

    assert_eq!(
        h.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn create_task_parses_due_dates_and_links_the_contact() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();

    run_workflow(
        &h,
        account_id,
        vec![fixtures::action(
            "create_task",
            1,
            json!({
                "title": "Call {{status}} lead",
                "contactId": contact_id,
                "dueDate": "2026-09-01T09:00:00Z",
            }),
        )],
        fixtures::payload(account_id),
    )
    .await;

    let tasks = h.store.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Call active lead");
    assert_eq!(tasks[0].contact_id, Some(contact_id));
    let due = tasks[0].due_at.unwrap();
    assert_eq!(due.to_rfc3339(), "2026-09-01T09:00:00+00:00");
}
