//! Bounded pool of task workers.
//!
//! The pool polls the store for claimable tasks and admits at most
//! `max_concurrent` at a time through a [`Semaphore`]. Each admitted task is
//! claimed, moved to `in_progress`, handed to a [`TaskHandler`] on its own
//! tokio task, and reported back as `completed` or with its failure recorded
//! in metadata.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fl_core::task_store::{PollRequest, ProgressUpdate, TaskStore, TaskStoreError};
use fl_core::types::{Metadata, Task, TaskStatus};
use fl_harness::provider::Message;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::TaskContext;
use crate::engine::{ExecutionResult, ToolExecutionEngine};
use crate::validated::generate_validated;

/// Runs one claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, ctx: &mut TaskContext) -> ExecutionResult;
}

// ---------------------------------------------------------------------------
// Engine-backed handler
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You complete coding tasks by calling tools. Reply with exactly one \
JSON object {\"tool\": \"<name>\", \"arguments\": {...}} per turn. When the work is done, reply \
with a short plain-text summary instead.";

/// Gets the first tool call through validated generation, then lets the
/// engine drive the rest.
pub struct EngineTaskHandler {
    engine: Arc<ToolExecutionEngine>,
    validation_attempts: usize,
}

impl EngineTaskHandler {
    pub fn new(engine: Arc<ToolExecutionEngine>) -> Self {
        Self {
            engine,
            validation_attempts: 5,
        }
    }

    /// Handler with `engine.validation_attempts` from the config file.
    pub fn from_config(engine: Arc<ToolExecutionEngine>, cfg: &fl_core::config::EngineConfig) -> Self {
        Self::new(engine).with_validation_attempts(cfg.validation_attempts as usize)
    }

    pub fn with_validation_attempts(mut self, attempts: usize) -> Self {
        self.validation_attempts = attempts;
        self
    }

    pub fn validation_attempts(&self) -> usize {
        self.validation_attempts
    }

    fn system_prompt(&self) -> String {
        format!("{SYSTEM_PROMPT}\n\nAvailable tools:\n{}", self.engine.tools().catalog())
    }

    fn user_prompt(task: &Task, ctx: &TaskContext) -> String {
        let mut prompt = format!("Task {}: {}\n", task.key, task.title);
        if !task.description.is_empty() {
            prompt.push_str(&format!("\n{}\n", task.description));
        }
        if let Some(path) = ctx.project_path() {
            prompt.push_str(&format!("\nProject path: {}\n", path.display()));
        }
        if !ctx.dependency_files().is_empty() {
            let files: Vec<String> = ctx
                .dependency_files()
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            prompt.push_str(&format!("Files from dependencies: {}\n", files.join(", ")));
        }
        if let Some(changes) = task.metadata.get("required_changes") {
            prompt.push_str(&format!("\nReviewer requested changes: {changes}\n"));
        }
        prompt
    }
}

#[async_trait]
impl TaskHandler for EngineTaskHandler {
    async fn handle(&self, task: &Task, ctx: &mut TaskContext) -> ExecutionResult {
        let system = self.system_prompt();
        let user = Self::user_prompt(task, ctx);
        let messages = [Message::system(system.clone()), Message::user(user.clone())];
        let first = match generate_validated(
            self.engine.provider().as_ref(),
            self.engine.config().purpose,
            &messages,
            self.validation_attempts,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(task_key = %task.key, error = %e, "no usable first tool call");
                return ExecutionResult::failed(&e);
            }
        };
        self.engine.execute(first.raw, &system, &user, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub task_key: String,
    pub agent: String,
    pub success: bool,
    pub error: Option<String>,
    pub iterations: usize,
}

pub struct WorkerPool {
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
    gate: Arc<Semaphore>,
    max_concurrent: usize,
    poll_interval: Duration,
    task_types: Vec<String>,
    name_prefix: String,
    handles: Mutex<Vec<JoinHandle<()>>>,
    reports_tx: flume::Sender<WorkerReport>,
    reports_rx: flume::Receiver<WorkerReport>,
}

impl WorkerPool {
    pub fn new(store: Arc<TaskStore>, handler: Arc<dyn TaskHandler>, max_concurrent: usize) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, using 1");
            1
        } else {
            max_concurrent
        };
        let (reports_tx, reports_rx) = flume::unbounded();
        Self {
            store,
            handler,
            gate: Arc::new(Semaphore::new(limit)),
            max_concurrent: limit,
            poll_interval: Duration::from_millis(500),
            task_types: Vec::new(),
            name_prefix: "worker".into(),
            handles: Mutex::new(Vec::new()),
            reports_tx,
            reports_rx,
        }
    }

    /// Pool sized and paced by the `[agents]` section.
    pub fn from_config(
        store: Arc<TaskStore>,
        handler: Arc<dyn TaskHandler>,
        cfg: &fl_core::config::AgentsConfig,
    ) -> Self {
        Self::new(store, handler, cfg.max_concurrent as usize).with_poll_interval(cfg.poll_interval())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Only take tasks of these types.
    pub fn with_task_types(mut self, types: Vec<String>) -> Self {
        self.task_types = types;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Workers currently holding a slot.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.gate.available_permits()
    }

    /// Claim as many ready tasks as there are free slots and start a worker
    /// for each. Returns the keys started.
    pub async fn dispatch(&self) -> Result<Vec<String>, TaskStoreError> {
        let free = self.gate.available_permits();
        if free == 0 {
            return Ok(Vec::new());
        }
        let mut request = PollRequest::new(self.name_prefix.clone());
        request.max_tasks = free;
        request.task_types = self.task_types.clone();
        let candidates = self.store.poll(request).await?;

        let mut started = Vec::new();
        for task in candidates {
            let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() else {
                break;
            };
            let agent = format!("{}-{}", self.name_prefix, &Uuid::new_v4().simple().to_string()[..8]);
            match self.store.claim(&task.key, &agent).await {
                Ok(claimed) => {
                    started.push(claimed.key.clone());
                    self.spawn(claimed, agent, permit);
                }
                Err(TaskStoreError::ClaimConflict { key, conflict }) => {
                    debug!(task_key = %key, reason = conflict.reason(), "lost claim race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    fn spawn(&self, task: Task, agent: String, permit: OwnedSemaphorePermit) {
        let store = Arc::clone(&self.store);
        let handler = Arc::clone(&self.handler);
        let reports = self.reports_tx.clone();
        let handle = tokio::spawn(async move {
            let report = run_worker(store, handler, task, agent).await;
            drop(permit);
            let _ = reports.send(report);
        });
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every started worker and return all reports not yet taken.
    pub async fn drain(&self) -> Vec<WorkerReport> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        self.reports_rx.try_iter().collect()
    }

    /// Dispatch every poll interval until `shutdown` becomes `true`, then
    /// wait for running workers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Vec<WorkerReport> {
        info!(max_concurrent = self.max_concurrent, "worker pool started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.dispatch().await {
                Ok(keys) if !keys.is_empty() => debug!(tasks = ?keys, "dispatched"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dispatch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        let reports = self.drain().await;
        info!(finished = reports.len(), "worker pool stopped");
        reports
    }
}

async fn run_worker(
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
    task: Task,
    agent: String,
) -> WorkerReport {
    let key = task.key.clone();
    let mut report = WorkerReport {
        task_key: key.clone(),
        agent: agent.clone(),
        success: false,
        error: None,
        iterations: 0,
    };

    let task = match store
        .update_progress(&key, TaskStatus::InProgress, ProgressUpdate::percent(0).note("started").by(&agent))
        .await
    {
        Ok(task) => task,
        Err(e) => {
            warn!(task_key = %key, error = %e, "could not start task");
            report.error = Some(e.to_string());
            return report;
        }
    };

    let mut dependencies = Vec::with_capacity(task.depends_on.len());
    for dep in &task.depends_on {
        match store.get_task(dep).await {
            Ok(Some(d)) => dependencies.push(d),
            Ok(None) => warn!(task_key = %key, dependency = %dep, "dependency vanished"),
            Err(e) => warn!(task_key = %key, dependency = %dep, error = %e, "dependency lookup failed"),
        }
    }
    let mut ctx = TaskContext::from_task(&task, &dependencies);
    info!(task_key = %key, agent = %agent, attempt = ctx.attempt(), "worker started");

    let result = handler.handle(&task, &mut ctx).await;
    report.success = result.success;
    report.iterations = result.iterations;
    report.error = result.error.clone();

    if result.success {
        let update = ProgressUpdate {
            percent: Some(100),
            note: Some("completed".into()),
            result: Some(result.output.clone()),
            artifacts: result.artifacts.iter().map(|p| p.display().to_string()).collect(),
            agent: Some(agent.clone()),
        };
        if let Err(e) = store.update_progress(&key, TaskStatus::Completed, update).await {
            warn!(task_key = %key, error = %e, "could not record completion");
            report.success = false;
            report.error = Some(e.to_string());
        }
    } else {
        let mut patch = Metadata::new();
        patch.insert("attempts".into(), json!(ctx.attempt()));
        patch.insert(
            "last_failure".into(),
            json!({
                "kind": result.failure,
                "error": result.error,
                "tools": result.tools_executed,
                "iterations": result.iterations,
                "hallucination": result.hallucination_detected,
                "agent": agent,
            }),
        );
        if let Err(e) = store.merge_metadata(&key, patch).await {
            warn!(task_key = %key, error = %e, "could not record failure");
        }
    }
    info!(task_key = %key, agent = %agent, success = report.success, "worker finished");
    report
}
