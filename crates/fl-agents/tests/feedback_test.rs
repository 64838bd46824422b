use std::sync::Arc;
use std::time::Duration;

use fl_agents::classify::BuildSeverity;
use fl_agents::feedback::{EscalationRequest, FeedbackChannel, FeedbackError, QueueFeedbackChannel, FIX_TASK_TYPE};
use fl_core::task_store::{ProgressUpdate, QueueFilter, ReviewSubmission, TaskStore};
use fl_core::types::{MessageType, NewTask, ReviewStatus, ReviewType, Task, TaskStatus};
use serde_json::Value;
use tokio::sync::watch;

fn request() -> EscalationRequest {
    EscalationRequest {
        dependency_description: "Resolve the build failure blocking TASK-001".into(),
        dependency_type: "build_fix".into(),
        error_message: "a.go:1: import cycle not allowed".into(),
        error_type: "compile".into(),
        severity: BuildSeverity::Complex,
        affected_files: 2,
        error_count: 2,
        target_path: "/tmp/project".into(),
        target_file: "/tmp/project/a.go".into(),
        suggestion: "Break the import cycle.".into(),
    }
}

async fn setup() -> (Arc<TaskStore>, Task, Arc<QueueFeedbackChannel>) {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    let origin = store
        .create_task(NewTask::new("origin").priority(5))
        .await
        .unwrap();
    let channel = Arc::new(
        QueueFeedbackChannel::new(store.clone(), "worker-1")
            .with_recheck_interval(Duration::from_millis(20)),
    );
    (store, origin, channel)
}

async fn wait_for_fix_task(store: &TaskStore) -> Task {
    for _ in 0..200 {
        let snapshot = store
            .get_queue(QueueFilter {
                task_type: Some(FIX_TASK_TYPE.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        if let Some(task) = snapshot.tasks.into_iter().next() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fix task never appeared");
}

async fn resolve(store: &TaskStore, key: &str, verdict: ReviewStatus) {
    store.claim(key, "fixer").await.unwrap();
    store
        .update_progress(key, TaskStatus::InProgress, ProgressUpdate::default())
        .await
        .unwrap();
    store
        .update_progress(key, TaskStatus::Completed, ProgressUpdate::default())
        .await
        .unwrap();
    let review = store
        .request_review(key, ReviewType::Code, "fixed", None)
        .await
        .unwrap();
    store
        .submit_review(review.id, ReviewSubmission::new(verdict, "checked"))
        .await
        .unwrap();
}

#[tokio::test]
async fn wait_returns_when_fix_task_is_done() {
    let (store, origin, channel) = setup().await;

    let waiter = {
        let channel = channel.clone();
        let key = origin.key.clone();
        tokio::spawn(async move {
            channel
                .send_and_wait(Some(&key), request(), Duration::from_secs(10))
                .await
        })
    };

    let fix = wait_for_fix_task(&store).await;
    assert_eq!(fix.parent_id, Some(origin.id));
    assert_eq!(fix.priority, 6);
    assert_eq!(fix.status, TaskStatus::Ready);
    assert_eq!(fix.metadata["escalated_from"], origin.key.as_str());
    assert_eq!(fix.metadata["escalation"]["severity"], "complex");
    assert_eq!(fix.metadata["project_path"], "/tmp/project");

    let waiting = store.task(&origin.key).await.unwrap();
    assert_eq!(waiting.metadata["waiting_on"], fix.key.as_str());

    resolve(&store, &fix.key, ReviewStatus::Approved).await;

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome.fix_task, fix.key);

    let origin_after = store.task(&origin.key).await.unwrap();
    assert_eq!(origin_after.metadata["waiting_on"], Value::Null);

    let escalations: Vec<_> = store
        .messages_about(&fix.key)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.message_type == MessageType::Escalation)
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].sender, "worker-1");
    assert_eq!(escalations[0].receiver.as_deref(), Some("supervisor"));
}

#[tokio::test]
async fn rejected_fix_fails_the_wait() {
    let (store, origin, channel) = setup().await;

    let waiter = {
        let channel = channel.clone();
        let key = origin.key.clone();
        tokio::spawn(async move {
            channel
                .send_and_wait(Some(&key), request(), Duration::from_secs(10))
                .await
        })
    };

    let fix = wait_for_fix_task(&store).await;
    resolve(&store, &fix.key, ReviewStatus::Rejected).await;

    match waiter.await.unwrap() {
        Err(FeedbackError::FixFailed { task_key, status }) => {
            assert_eq!(task_key, fix.key);
            assert_eq!(status, TaskStatus::Rejected);
        }
        other => panic!("expected FixFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_times_out() {
    let (_store, origin, channel) = setup().await;

    let err = channel
        .send_and_wait(Some(&origin.key), request(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedbackError::Timeout(d) if d == Duration::from_millis(100)));
}

#[tokio::test]
async fn shutdown_cancels_the_wait() {
    let (store, origin, _) = setup().await;
    let (tx, rx) = watch::channel(false);
    let channel = QueueFeedbackChannel::new(store.clone(), "worker-1").with_shutdown(rx);

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
    });

    let err = channel
        .send_and_wait(Some(&origin.key), request(), Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedbackError::Cancelled));
    cancel.await.unwrap();
}

#[tokio::test]
async fn unknown_origin_is_a_store_error() {
    let (_store, _origin, channel) = setup().await;
    let err = channel
        .send_and_wait(Some("TASK-404"), request(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedbackError::Store(_)));
}

#[tokio::test]
async fn escalation_without_origin_creates_a_root_fix_task() {
    let (store, _origin, channel) = setup().await;
    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send_and_wait(None, request(), Duration::from_secs(10)).await })
    };

    let fix = wait_for_fix_task(&store).await;
    assert_eq!(fix.parent_id, None);
    assert_eq!(fix.priority, 0);
    resolve(&store, &fix.key, ReviewStatus::Approved).await;
    assert!(waiter.await.unwrap().is_ok());
}
