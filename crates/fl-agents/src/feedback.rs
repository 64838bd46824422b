//! Feedback channel between the execution engine and the layer above it.
//!
//! Two operations: [`send`](FeedbackChannel::send) is a fire-and-forget
//! notification and [`send_and_wait`](FeedbackChannel::send_and_wait)
//! hands a blocking build failure to someone else by creating a fix task
//! and waiting for it to reach a terminal state. The wait always has a
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fl_core::task_store::{TaskStore, TaskStoreError};
use fl_core::types::{FeedbackMessage, Metadata, MessageType, NewTask, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::BuildSeverity;

/// Task type given to tasks created by escalation.
pub const FIX_TASK_TYPE: &str = "fix";

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("escalation timed out after {0:?}")]
    Timeout(Duration),
    #[error("escalation cancelled by shutdown")]
    Cancelled,
    #[error("fix task {task_key} ended in {status}")]
    FixFailed { task_key: String, status: TaskStatus },
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    #[error("feedback channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FeedbackError>;

/// Escalation payload describing the failure a fix task must resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub dependency_description: String,
    pub dependency_type: String,
    pub error_message: String,
    pub error_type: String,
    pub severity: BuildSeverity,
    pub affected_files: usize,
    pub error_count: usize,
    pub target_path: String,
    pub target_file: String,
    pub suggestion: String,
}

impl EscalationRequest {
    fn title(&self) -> String {
        let file = if self.target_file.is_empty() {
            self.target_path.as_str()
        } else {
            self.target_file.as_str()
        };
        format!("Fix {} errors in {}", self.error_type, file)
    }

    fn description(&self) -> String {
        format!(
            "{}\n\nSeverity: {} ({} errors across {} files)\nTarget: {}\n\nErrors:\n{}\n\nSuggested fix: {}",
            self.dependency_description,
            self.severity,
            self.error_count,
            self.affected_files,
            self.target_path,
            self.error_message,
            self.suggestion,
        )
    }
}

#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    /// Key of the fix task, now `done`.
    pub fix_task: String,
    pub waited: Duration,
}

#[async_trait]
pub trait FeedbackChannel: Send + Sync {
    /// Deliver a notification. Never blocks on the receiver.
    async fn send(&self, message: FeedbackMessage) -> Result<()>;

    /// Create a fix task for `request` on behalf of the task keyed `origin`
    /// and wait until it is `done` (success) or `rejected` (failure).
    async fn send_and_wait(
        &self,
        origin: Option<&str>,
        request: EscalationRequest,
        timeout: Duration,
    ) -> Result<EscalationOutcome>;
}

// ---------------------------------------------------------------------------
// Queue-backed implementation
// ---------------------------------------------------------------------------

/// [`FeedbackChannel`] over the task store. Fix tasks are ordinary queue
/// entries, so any worker (or a human through the CLI) can resolve them.
pub struct QueueFeedbackChannel {
    store: Arc<TaskStore>,
    sender: String,
    recheck_interval: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl QueueFeedbackChannel {
    pub fn new(store: Arc<TaskStore>, sender: impl Into<String>) -> Self {
        Self {
            store,
            sender: sender.into(),
            recheck_interval: Duration::from_secs(2),
            shutdown: None,
        }
    }

    /// How often the fix task is re-read when no bus traffic arrives.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Abort waits with [`FeedbackError::Cancelled`] once this flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    async fn create_fix_task(&self, origin: Option<&Task>, request: &EscalationRequest) -> Result<Task> {
        let mut new = NewTask::new(request.title())
            .description(request.description())
            .task_type(FIX_TASK_TYPE)
            .meta(
                "escalation",
                serde_json::to_value(request).unwrap_or_default(),
            )
            .meta("project_path", json!(request.target_path));
        if let Some(origin) = origin {
            new = new
                .parent(origin.id)
                .priority(origin.priority.saturating_add(1))
                .meta("escalated_from", json!(origin.key));
        }
        Ok(self.store.create_task(new).await?)
    }
}

#[async_trait]
impl FeedbackChannel for QueueFeedbackChannel {
    async fn send(&self, message: FeedbackMessage) -> Result<()> {
        self.store.log_message(message).await?;
        Ok(())
    }

    async fn send_and_wait(
        &self,
        origin: Option<&str>,
        request: EscalationRequest,
        timeout: Duration,
    ) -> Result<EscalationOutcome> {
        // Subscribe before creating the task so no status message is missed.
        let updates = self.store.bus().subscribe();
        let started = Instant::now();
        let deadline = started + timeout;

        let origin_task = match origin {
            Some(key) => Some(self.store.task(key).await?),
            None => None,
        };
        let fix = self.create_fix_task(origin_task.as_ref(), &request).await?;

        if let Some(origin) = &origin_task {
            let mut patch = Metadata::new();
            patch.insert("waiting_on".into(), json!(fix.key));
            self.store.merge_metadata(&origin.key, patch).await?;
        }

        let note = FeedbackMessage::new(
            &self.sender,
            Some(self.store.supervisor().to_string()),
            MessageType::Escalation,
            format!(
                "{} build failure escalated as {}: {}",
                request.severity, fix.key, request.suggestion
            ),
        )
        .about(&fix.key);
        self.send(note).await?;
        info!(
            fix_task = %fix.key,
            origin = origin.unwrap_or("-"),
            severity = %request.severity,
            timeout_secs = timeout.as_secs(),
            "escalated build failure, waiting for fix"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            let current = self.store.task(&fix.key).await?;
            match current.status {
                TaskStatus::Done => {
                    info!(fix_task = %fix.key, "fix task done");
                    self.clear_waiting(origin).await;
                    return Ok(EscalationOutcome {
                        fix_task: current.key,
                        waited: started.elapsed(),
                    });
                }
                TaskStatus::Rejected => {
                    warn!(fix_task = %fix.key, "fix task rejected");
                    self.clear_waiting(origin).await;
                    return Err(FeedbackError::FixFailed {
                        task_key: fix.key,
                        status: current.status,
                    });
                }
                status => debug!(fix_task = %fix.key, %status, "fix task still open"),
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(fix_task = %fix.key, "escalation wait timed out");
                    return Err(FeedbackError::Timeout(timeout));
                }
                received = updates.recv_async() => {
                    if received.is_err() {
                        return Err(FeedbackError::Closed);
                    }
                }
                _ = tokio::time::sleep(self.recheck_interval) => {}
                _ = shutdown_requested(&mut shutdown) => {
                    warn!(fix_task = %fix.key, "escalation wait cancelled");
                    return Err(FeedbackError::Cancelled);
                }
            }
        }
    }
}

impl QueueFeedbackChannel {
    async fn clear_waiting(&self, origin: Option<&str>) {
        let Some(key) = origin else { return };
        let mut patch = Metadata::new();
        patch.insert("waiting_on".into(), Value::Null);
        if let Err(e) = self.store.merge_metadata(key, patch).await {
            warn!(task_key = %key, error = %e, "failed to clear waiting_on");
        }
    }
}

/// Resolves once the watch flips to `true`; pends forever without one.
async fn shutdown_requested(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        None => std::future::pending::<()>().await,
    }
}
