//! Runner state machine tests: ordering, condition gates, wait/resume,
//! branching, failure recording and retry resumption.

use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::queue::{ResumePoint, WorkflowJobMessage};
use crate::store::Store;
use crate::tests::fixtures;
use crate::tests::helpers::EngineHarness;
use crate::workflows::jobs::JobStatus;

#[tokio::test]
async fn linear_actions_execute_in_order_exactly_once() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    for (order, title) in [(1, "one"), (2, "two"), (3, "three")] {
        h.store
            .add_action(
                account_id,
                workflow.id,
                fixtures::action("create_task", order, json!({"title": title})),
            )
            .await
            .unwrap();
    }

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

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["one", "two", "three"]);

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let run = h.store.latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, JobStatus::Completed);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());
    assert!(run.error.is_none());
}

#[tokio::test]
async fn false_condition_skips_action_but_run_completes() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action_with_condition(
                "create_task",
                1,
                json!({"title": "guarded"}),
                "triggerPayload.status equals 'churned'",
            ),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 2, json!({"title": "unconditional"})),
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

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["unconditional"]);
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn wait_action_suspends_and_continuation_resumes_after_it() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "send_email",
                1,
                json!({"to": "ada@example.com", "body": "hello"}),
            ),
        )
        .await
        .unwrap();
    let wait = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("wait", 2, json!({"delayType": "minutes", "delayValue": 5})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 3, json!({"title": "follow up"})),
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

    assert_eq!(h.emails.lock().await.len(), 1);
    assert!(h.store.tasks().await.is_empty());
    let paused = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::Waiting);
    assert_eq!(
        h.store.latest_run(job.id).await.unwrap().unwrap().status,
        JobStatus::Waiting
    );

    let mut queued = h.queue.drain().await;
    assert_eq!(queued.len(), 1);
    let (continuation, options) = queued.remove(0);
    assert_eq!(continuation.job_id, job.id);
    assert_eq!(continuation.resume, Some(ResumePoint::AfterAction(wait.id)));
    assert_eq!(options.delay, Duration::from_secs(300));

    h.runner.process(continuation).await.unwrap();

    // Resumed past the wait: the email is not re-sent.
    assert_eq!(h.emails.lock().await.len(), 1);
    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["follow up"]);
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn branch_true_path_jumps_over_intermediate_actions() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 2, json!({"title": "mid"})),
        )
        .await
        .unwrap();
    let end = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 3, json!({"title": "end"})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "branch",
                1,
                json!({
                    "expression": "triggerPayload.status equals 'active'",
                    "trueBranchActionId": end.id,
                }),
            ),
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

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["end"]);
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn branch_without_target_falls_through_sequentially() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    // Expression is false and no falseBranchActionId is configured.
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "branch",
                1,
                json!({"expression": "triggerPayload.status equals 'churned'"}),
            ),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 2, json!({"title": "mid"})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 3, json!({"title": "end"})),
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

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["mid", "end"]);
}

#[tokio::test]
async fn branch_false_path_redirects_to_the_false_target() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 2, json!({"title": "true path"})),
        )
        .await
        .unwrap();
    let fallback = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 3, json!({"title": "fallback"})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "branch",
                1,
                json!({
                    "expression": "triggerPayload.status equals 'churned'",
                    "falseBranchActionId": fallback.id,
                }),
            ),
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

    // The payload status is "active", so the false target wins and the
    // sequentially-next action is never reached.
    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["fallback"]);
    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn branch_pointing_backwards_fails_instead_of_looping() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    let first = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 1, json!({"title": "looped"})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "branch",
                2,
                json!({
                    "expression": "triggerPayload.status equals 'active'",
                    "trueBranchActionId": first.id,
                }),
            ),
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

    let result = h.runner.process(WorkflowJobMessage::initial(job.id)).await;
    assert!(result.is_err());

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let run = h.store.latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, JobStatus::Failed);
    assert!(run.error.unwrap().contains("cycle"));
}

#[tokio::test]
async fn unknown_action_type_fails_the_run_with_recorded_error() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    // Bypasses the API-level type validation on purpose.
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("launch_rocket", 1, json!({})),
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

    let result = h.runner.process(WorkflowJobMessage::initial(job.id)).await;
    assert!(result.is_err());

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let run = h.store.latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.status, JobStatus::Failed);
    let error = run.error.unwrap();
    assert!(error.contains("launch_rocket"));
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn redelivery_after_failure_gets_fresh_attempt_and_skips_completed_actions() {
    let h = EngineHarness::with_email_failing(true);
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 1, json!({"title": "first"})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("wait", 2, json!({"delayValue": 1})),
        )
        .await
        .unwrap();
    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action(
                "send_email",
                3,
                json!({"to": "ada@example.com", "body": "hello"}),
            ),
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
    assert_eq!(h.store.tasks().await.len(), 1);

    let (continuation, _) = h.queue.drain().await.remove(0);

    // First delivery of the continuation fails on the email send.
    assert!(h.runner.process(continuation.clone()).await.is_err());
    let run = h.store.latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(run.attempt, 1);
    assert_eq!(run.status, JobStatus::Failed);

    // Redelivery resumes after the wait: "first" is not re-created and the
    // retry is recorded as a new attempt.
    assert!(h.runner.process(continuation).await.is_err());
    assert_eq!(h.store.tasks().await.len(), 1);

    let retry = h.store.latest_run(job.id).await.unwrap().unwrap();
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.status, JobStatus::Failed);
    assert!(retry.error.is_some());
}

#[tokio::test]
async fn per_action_delay_suspends_then_executes_exactly_once() {
    let h = EngineHarness::new();
    let account_id = Uuid::new_v4();
    let workflow = fixtures::active_workflow(&h.store, account_id).await;

    h.store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action("create_task", 1, json!({"title": "immediate"})),
        )
        .await
        .unwrap();
    let delayed = h
        .store
        .add_action(
            account_id,
            workflow.id,
            fixtures::action_with_delay(
                "create_task",
                2,
                json!({"title": "delayed"}),
                "minutes",
                10,
            ),
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

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["immediate"]);
    assert_eq!(
        h.store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Waiting
    );

    let mut queued = h.queue.drain().await;
    assert_eq!(queued.len(), 1);
    let (continuation, options) = queued.remove(0);
    assert_eq!(continuation.resume, Some(ResumePoint::AtAction(delayed.id)));
    assert_eq!(options.delay, Duration::from_secs(600));

    h.runner.process(continuation).await.unwrap();

    let titles: Vec<String> = h.store.tasks().await.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["immediate", "delayed"]);
    assert_eq!(
        h.store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    // The served delay must not re-suspend.
    assert_eq!(h.queue.len().await, 0);
}

#[tokio::test]
async fn dequeue_for_missing_job_is_dropped_without_retry() {
    let h = EngineHarness::new();

    let result = h
        .runner
        .process(WorkflowJobMessage::initial(Uuid::new_v4()))
        .await;

    assert!(result.is_ok());
    assert_eq!(h.queue.len().await, 0);
}
