use super::super::*;
use crate::models::TaskStatus;
use crate::store::BatchStore;
use crate::tests::test_helpers::*;
use std::sync::Arc;

#[test]
fn test_default_classifier_retries_transient_errors() {
    let classify = default_classifier();
    assert_eq!(classify("connection timed out"), ErrorClass::Retryable);
    assert_eq!(classify("429 rate limited"), ErrorClass::Retryable);
    assert_eq!(classify("container restart"), ErrorClass::Retryable);
}

#[test]
fn test_default_classifier_flags_permanent_errors() {
    let classify = default_classifier();
    assert_eq!(classify("401 Unauthorized"), ErrorClass::Fatal);
    assert_eq!(classify("request validation failed"), ErrorClass::Fatal);
    assert_eq!(classify("prompt exceeds context length"), ErrorClass::Fatal);
}

#[tokio::test]
async fn test_create_rejects_empty_inputs() {
    let (manager, _) = test_manager(Arc::new(MockSessionBackend::new()));
    let request = simple_request("empty", &[]);
    let err = manager.create_batch(request).await.unwrap_err();
    assert!(matches!(err, VesselError::Validation(_)));
}

#[tokio::test]
async fn test_create_rejects_malformed_template() {
    let (manager, _) = test_manager(Arc::new(MockSessionBackend::new()));
    let mut request = simple_request("bad-template", &["a"]);
    request.prompt_template = "Say {{x}}".to_string();
    let err = manager.create_batch(request).await.unwrap_err();
    assert!(matches!(err, VesselError::Template(_)));
}

#[tokio::test]
async fn test_create_rejects_unknown_agent() {
    let (manager, store) = test_manager(Arc::new(MockSessionBackend::new()));
    let mut request = simple_request("no-agent", &["a"]);
    request.agent_ref = "missing-agent".to_string();
    let err = manager.create_batch(request).await.unwrap_err();
    assert!(matches!(err, VesselError::Validation(_)));

    // Nothing was persisted for the rejected batch.
    let (batches, total) = store.list_batches(&Default::default()).await.unwrap();
    assert!(batches.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_create_applies_defaults() {
    let (manager, _) = test_manager(Arc::new(MockSessionBackend::new()));
    let mut request = simple_request("defaults", &["a"]);
    request.concurrency = None;
    request.timeout_secs = None;
    request.max_retries = None;
    let batch = manager.create_batch(request).await.unwrap();
    assert_eq!(batch.concurrency, 5);
    assert_eq!(batch.template.timeout_secs, 300);
    assert_eq!(batch.template.max_retries, 0);
}

#[tokio::test]
async fn test_start_unknown_batch_is_not_found() {
    let (manager, _) = test_manager(Arc::new(MockSessionBackend::new()));
    let err = manager.start_batch("batch-deadbeef").await.unwrap_err();
    assert!(matches!(err, VesselError::NotFound(_)));
}

#[tokio::test]
async fn test_start_from_terminal_status_rejected() {
    let (manager, store) = test_manager(Arc::new(MockSessionBackend::new()));
    let batch = manager
        .create_batch(simple_request("terminal", &["a"]))
        .await
        .unwrap();

    let mut stored = store.get_batch(&batch.id).await.unwrap();
    stored.status = BatchStatus::Cancelled;
    store.update_batch(&stored).await.unwrap();

    let err = manager.start_batch(&batch.id).await.unwrap_err();
    assert!(matches!(err, VesselError::Validation(_)));
}

#[tokio::test]
async fn test_pause_and_cancel_require_running() {
    let (manager, _) = test_manager(Arc::new(MockSessionBackend::new()));
    let batch = manager
        .create_batch(simple_request("idle", &["a"]))
        .await
        .unwrap();

    assert!(matches!(
        manager.pause_batch(&batch.id).await.unwrap_err(),
        VesselError::NotRunning(_)
    ));
    assert!(matches!(
        manager.cancel_batch(&batch.id).await.unwrap_err(),
        VesselError::NotRunning(_)
    ));
}

#[tokio::test]
async fn test_retry_failed_resets_tasks_and_counters() {
    let (manager, store) = test_manager(Arc::new(MockSessionBackend::new()));
    let batch = manager
        .create_batch(simple_request("retry-failed", &["a", "b"]))
        .await
        .unwrap();

    // Collaborator-marked failure: one task Failed, counters to match.
    let mut task = store.get_task(&format!("{}-0", batch.id)).await.unwrap();
    task.status = TaskStatus::Failed;
    task.error = Some("marked failed".to_string());
    task.duration_ms = Some(9);
    store.update_task(&task).await.unwrap();
    store.update_counters(&batch.id, 0, 1, 0).await.unwrap();
    let mut stored = store.get_batch(&batch.id).await.unwrap();
    stored.status = BatchStatus::Failed;
    stored
        .error_counts
        .insert("marked failed".to_string(), 1);
    store.update_batch(&stored).await.unwrap();

    let count = manager.retry_failed(&batch.id).await.unwrap();
    assert_eq!(count, 1);

    let reset = store.get_task(&task.id).await.unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert!(reset.error.is_none());
    assert!(reset.duration_ms.is_none());

    let after = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(after.failed, 0);
    assert_eq!(after.status, BatchStatus::Pending);
    assert!(after.error_counts.is_empty());
}

#[tokio::test]
async fn test_retry_dead_restores_terminal_batch_to_pending() {
    let (manager, store) = test_manager(Arc::new(MockSessionBackend::new()));
    let batch = manager
        .create_batch(simple_request("retry-dead", &["a"]))
        .await
        .unwrap();

    let mut task = store.get_task(&format!("{}-0", batch.id)).await.unwrap();
    task.attempts = 1;
    task.error = Some("boom".to_string());
    store
        .mark_task_dead(&task, "max_retries_exceeded: boom")
        .await
        .unwrap();
    store.update_counters(&batch.id, 0, 0, 1).await.unwrap();
    let mut stored = store.get_batch(&batch.id).await.unwrap();
    stored.status = BatchStatus::Failed;
    store.update_batch(&stored).await.unwrap();

    let count = manager.retry_dead_tasks(&batch.id, &[]).await.unwrap();
    assert_eq!(count, 1);

    let after = store.get_batch(&batch.id).await.unwrap();
    assert_eq!(after.status, BatchStatus::Pending);
    assert_eq!(after.dead, 0);
    let retried = store.get_task(&task.id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.attempts, 0);
}
