use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fl_agents::engine::{ExecutionResult, FailureKind, ToolExecutionEngine};
use fl_agents::feedback::QueueFeedbackChannel;
use fl_agents::{EngineTaskHandler, TaskContext, TaskHandler, WorkerPool};
use fl_core::task_store::{ProgressUpdate, QueueFilter, ReviewSubmission, TaskStore};
use fl_core::types::{NewTask, ReviewStatus, ReviewType, Task, TaskStatus};
use fl_harness::provider::ScriptedProvider;
use fl_harness::tools::{Tool, ToolDefinition, ToolError, ToolOutput, ToolRegistry};
use serde_json::{json, Value};
use tokio::sync::watch;

#[derive(Default)]
struct CountingHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
    handled: AtomicUsize,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, task: &Task, _ctx: &mut TaskContext) -> ExecutionResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        ExecutionResult {
            success: true,
            output: format!("handled {}", task.key),
            ..Default::default()
        }
    }
}

struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, _task: &Task, _ctx: &mut TaskContext) -> ExecutionResult {
        ExecutionResult {
            success: false,
            error: Some("model described the work instead of calling a tool".into()),
            failure: Some(FailureKind::Hallucination),
            hallucination_detected: true,
            iterations: 1,
            ..Default::default()
        }
    }
}

async fn count(store: &TaskStore, status: TaskStatus) -> usize {
    store
        .get_queue(QueueFilter::default())
        .await
        .unwrap()
        .counts_by_status
        .get(&status)
        .copied()
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_the_limit() {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    for i in 0..6 {
        store
            .create_task(NewTask::new(format!("job {i}")))
            .await
            .unwrap();
    }
    let handler = Arc::new(CountingHandler::default());
    let pool = Arc::new(
        WorkerPool::new(store.clone(), handler.clone(), 2).with_poll_interval(Duration::from_millis(10)),
    );
    let (tx, rx) = watch::channel(false);
    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(rx).await })
    };

    for _ in 0..500 {
        if count(&store, TaskStatus::Completed).await == 6 {
            break;
        }
        assert!(pool.active() <= 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    let reports = running.await.unwrap();

    assert_eq!(count(&store, TaskStatus::Completed).await, 6);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 6);
    let peak = handler.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    assert_eq!(reports.len(), 6);
    assert!(reports.iter().all(|r| r.success));

    let done = store.task("TASK-001").await.unwrap();
    assert_eq!(done.result.as_deref(), Some("handled TASK-001"));
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.assigned_to.unwrap().starts_with("worker-"));
}

#[tokio::test]
async fn failures_are_recorded_and_task_stays_in_progress() {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    let task = store.create_task(NewTask::new("job")).await.unwrap();
    let pool = WorkerPool::new(store.clone(), Arc::new(FailingHandler), 1);

    let started = pool.dispatch().await.unwrap();
    assert_eq!(started, vec![task.key.clone()]);
    let reports = pool.drain().await;

    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    let after = store.task(&task.key).await.unwrap();
    assert_eq!(after.status, TaskStatus::InProgress);
    assert_eq!(after.metadata["attempts"], 1);
    assert_eq!(after.metadata["last_failure"]["kind"], "hallucination");
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn blocked_tasks_wait_for_their_dependencies() {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    let first = store.create_task(NewTask::new("first")).await.unwrap();
    let second = store
        .create_task(NewTask::new("second").depends_on([first.key.clone()]))
        .await
        .unwrap();
    let pool = WorkerPool::new(store.clone(), Arc::new(CountingHandler::default()), 4);

    assert_eq!(pool.dispatch().await.unwrap(), vec![first.key.clone()]);
    pool.drain().await;
    assert!(pool.dispatch().await.unwrap().is_empty());

    let review = store
        .request_review(&first.key, ReviewType::Code, "", None)
        .await
        .unwrap();
    store
        .submit_review(review.id, ReviewSubmission::new(ReviewStatus::Approved, "ok"))
        .await
        .unwrap();

    assert_eq!(pool.dispatch().await.unwrap(), vec![second.key.clone()]);
    pool.drain().await;
    assert_eq!(store.task(&second.key).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn claimed_tasks_are_not_dispatched() {
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    let task = store.create_task(NewTask::new("contested")).await.unwrap();
    let pool = WorkerPool::new(store.clone(), Arc::new(CountingHandler::default()), 2);

    store.claim(&task.key, "someone-else").await.unwrap();
    store
        .update_progress(&task.key, TaskStatus::InProgress, ProgressUpdate::default())
        .await
        .unwrap();

    assert!(pool.dispatch().await.unwrap().is_empty());
    assert_eq!(pool.active(), 0);
}

// ---------------------------------------------------------------------------
// Engine-backed handler, end to end
// ---------------------------------------------------------------------------

struct CannedGenerate;

#[async_trait]
impl Tool for CannedGenerate {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "generate_code",
            "canned",
            json!({"type": "object", "properties": {"description": {"type": "string"}}, "required": ["description"]}),
        )
    }

    async fn call(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::json(json!({"code": "print('hi')\n", "language": "python"})))
    }
}

struct PassingBuild;

#[async_trait]
impl Tool for PassingBuild {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("build", "always passes", json!({"type": "object"}))
    }

    async fn call(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::json(json!({"success": true, "error_count": 0, "errors": [], "output": ""})))
    }
}

#[tokio::test]
async fn engine_handler_completes_a_queued_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::open_in_memory().await.unwrap());
    let task = store
        .create_task(
            NewTask::new("hello")
                .description("Print hi in Python")
                .meta("project_path", json!(dir.path().display().to_string())),
        )
        .await
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([
        "Let me think about it.",
        r#"{"tool": "generate_code", "arguments": {"description": "print hi in python"}}"#,
    ]));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CannedGenerate));
    registry.register(Arc::new(fl_agents::builtin_tools::WriteFileTool));
    registry.register(Arc::new(PassingBuild));
    let feedback = Arc::new(QueueFeedbackChannel::new(store.clone(), "worker"));
    let engine = Arc::new(ToolExecutionEngine::new(provider.clone(), Arc::new(registry), feedback));
    let pool = WorkerPool::new(store.clone(), Arc::new(EngineTaskHandler::new(engine)), 1);

    pool.dispatch().await.unwrap();
    let reports = pool.drain().await;
    assert!(reports[0].success, "{:?}", reports[0].error);

    let done = store.task(&task.key).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let main = dir.path().join("main.py").display().to_string();
    assert!(done.artifacts.contains(&main));
    assert_eq!(provider.call_count(), 2);
    assert_eq!(std::fs::read_to_string(dir.path().join("main.py")).unwrap(), "print('hi')\n");
}
