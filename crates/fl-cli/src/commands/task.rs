//! Task lifecycle commands: create, ready, depend, claim, poll, progress.

use clap::Args;
use fl_core::task_store::{PollRequest, ProgressUpdate, TaskStore, TaskStoreError};
use fl_core::types::{NewTask, Task, TaskStatus};
use serde_json::{json, Value};
use std::str::FromStr;

use super::parse_meta;

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Short task title.
    pub title: String,
    /// Explicit key; the next TASK-NNN is allocated when omitted.
    #[arg(long)]
    pub key: Option<String>,
    #[arg(long, short, default_value = "")]
    pub description: String,
    #[arg(long = "type", default_value = "code")]
    pub task_type: String,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,
    /// Key of a task this one depends on (repeatable).
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
    /// Parent task key.
    #[arg(long)]
    pub parent: Option<String>,
    /// Create with an unmet Definition of Ready; `fl ready` releases it.
    #[arg(long)]
    pub hold: bool,
    /// Metadata entry as key=value (repeatable).
    #[arg(long = "meta", value_parser = parse_meta)]
    pub meta: Vec<(String, Value)>,
}

pub async fn create(store: &TaskStore, args: CreateArgs) -> anyhow::Result<Task> {
    let mut new = NewTask::new(args.title)
        .description(args.description)
        .task_type(args.task_type)
        .priority(args.priority)
        .depends_on(args.depends_on);
    if let Some(key) = args.key {
        new = new.key(key);
    }
    if let Some(parent) = args.parent {
        let parent = store.task(&parent).await?;
        new = new.parent(parent.id);
    }
    if args.hold {
        new = new.pending_readiness(json!({"held": "released with `fl ready`"}));
    }
    for (key, value) in args.meta {
        new = new.meta(key, value);
    }
    let task = store.create_task(new).await?;
    tracing::info!(task_key = %task.key, status = %task.status, "task created");
    Ok(task)
}

pub async fn claim(store: &TaskStore, key: &str, agent: &str) -> anyhow::Result<Value> {
    match store.claim(key, agent).await {
        Ok(task) => Ok(json!({"claimed": true, "task": task})),
        Err(TaskStoreError::ClaimConflict { key, conflict }) => {
            tracing::warn!(task_key = %key, reason = conflict.reason(), "claim rejected");
            Ok(json!({
                "claimed": false,
                "task_key": key,
                "reason": conflict.reason(),
                "detail": conflict.to_string(),
            }))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Args)]
pub struct PollArgs {
    #[arg(long, default_value = "operator")]
    pub agent: String,
    /// Restrict to these task types (repeatable).
    #[arg(long = "type")]
    pub task_types: Vec<String>,
    #[arg(long, default_value_t = 10)]
    pub max: usize,
    /// Minimum priority.
    #[arg(long, allow_negative_numbers = true)]
    pub min_priority: Option<i32>,
}

pub async fn poll(store: &TaskStore, args: PollArgs) -> anyhow::Result<Vec<Task>> {
    let mut request = PollRequest::new(args.agent);
    request.task_types = args.task_types;
    request.max_tasks = args.max;
    if let Some(p) = args.min_priority {
        request.priority_threshold = p;
    }
    Ok(store.poll(request).await?)
}

#[derive(Debug, Args)]
pub struct ProgressArgs {
    pub key: String,
    /// Target status: in_progress or completed.
    #[arg(value_parser = TaskStatus::from_str)]
    pub status: TaskStatus,
    #[arg(long)]
    pub percent: Option<u8>,
    #[arg(long)]
    pub note: Option<String>,
    #[arg(long)]
    pub result: Option<String>,
    /// Produced file (repeatable).
    #[arg(long = "artifact")]
    pub artifacts: Vec<String>,
    #[arg(long)]
    pub agent: Option<String>,
}

pub async fn progress(store: &TaskStore, args: ProgressArgs) -> anyhow::Result<Task> {
    let update = ProgressUpdate {
        percent: args.percent.map(|p| p.min(100)),
        note: args.note,
        result: args.result,
        artifacts: args.artifacts,
        agent: args.agent,
    };
    Ok(store.update_progress(&args.key, args.status, update).await?)
}
