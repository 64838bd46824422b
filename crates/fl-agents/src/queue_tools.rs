//! Task-queue operations exposed as tools, for agents and operators.
//!
//! Every tool returns JSON. A lost claim is a normal result
//! (`{"claimed": false, "reason": ...}`), not a tool failure.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use fl_core::task_store::{
    PollRequest, ProgressUpdate, QueueFilter, ReviewSubmission, TaskStore, TaskStoreError,
};
use fl_core::types::{ReviewFinding, ReviewStatus, ReviewType, TaskStatus};
use fl_harness::tools::{
    opt_str_arg, str_arg, Result, Tool, ToolCapabilities, ToolDefinition, ToolError, ToolOutput,
    ToolRegistry,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

const STATUS_VALUES: [&str; 10] = [
    "new",
    "ready",
    "blocked",
    "claimed",
    "in_progress",
    "completed",
    "in_review",
    "needs_changes",
    "done",
    "rejected",
];

/// Register all queue tools against `store`.
pub fn register_queue_tools(registry: &mut ToolRegistry, store: Arc<TaskStore>) {
    registry.register(Arc::new(ClaimTaskTool(store.clone())));
    registry.register(Arc::new(PollTasksTool(store.clone())));
    registry.register(Arc::new(UnblockTasksTool(store.clone())));
    registry.register(Arc::new(RequestReviewTool(store.clone())));
    registry.register(Arc::new(SubmitReviewTool(store.clone())));
    registry.register(Arc::new(UpdateProgressTool(store.clone())));
    registry.register(Arc::new(GetQueueTool(store)));
}

fn store_err(e: TaskStoreError) -> ToolError {
    ToolError::execution(e.to_string())
}

fn to_output<T: serde::Serialize>(value: &T) -> Result<ToolOutput> {
    serde_json::to_value(value)
        .map(ToolOutput::json)
        .map_err(|e| ToolError::execution(format!("serialize result: {e}")))
}

fn parse_arg<T>(args: &Value, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    opt_str_arg(args, key)
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| ToolError::execution(format!("invalid {key}: {e}")))
        })
        .transpose()
}

fn json_arg<T: DeserializeOwned>(args: &Value, key: &str) -> Result<Option<T>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| ToolError::execution(format!("invalid {key}: {e}"))),
    }
}

fn string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------

pub struct ClaimTaskTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for ClaimTaskTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "claim_task",
            "Claim a ready task for an agent. Exactly one concurrent claimant wins.",
            json!({
                "type": "object",
                "properties": {
                    "task_key": {"type": "string"},
                    "agent": {"type": "string"}
                },
                "required": ["task_key", "agent"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let key = str_arg(&arguments, "task_key")?;
        let agent = str_arg(&arguments, "agent")?;
        match self.0.claim(key, agent).await {
            Ok(task) => Ok(ToolOutput::json(json!({"claimed": true, "task": task}))),
            Err(TaskStoreError::ClaimConflict { key, conflict }) => {
                let mut body = serde_json::to_value(&conflict).unwrap_or_else(|_| json!({}));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("claimed".into(), json!(false));
                    obj.insert("task_key".into(), json!(key));
                }
                Ok(ToolOutput::json(body))
            }
            Err(e) => Err(store_err(e)),
        }
    }
}

pub struct PollTasksTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for PollTasksTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "poll_tasks",
            "List claimable tasks, highest priority first.",
            json!({
                "type": "object",
                "properties": {
                    "agent": {"type": "string"},
                    "task_types": {"type": "array", "items": {"type": "string"}},
                    "max_tasks": {"type": "integer"},
                    "priority_threshold": {"type": "integer"}
                },
                "required": ["agent"]
            }),
        )
        .with_capabilities(ToolCapabilities::read_only())
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let mut request = PollRequest::new(str_arg(&arguments, "agent")?);
        request.task_types = string_list(&arguments, "task_types");
        if let Some(n) = arguments.get("max_tasks").and_then(Value::as_u64) {
            request.max_tasks = n as usize;
        }
        if let Some(p) = arguments.get("priority_threshold").and_then(Value::as_i64) {
            request.priority_threshold = p.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        }
        let tasks = self.0.poll(request).await.map_err(store_err)?;
        Ok(ToolOutput::json(json!({"count": tasks.len(), "tasks": tasks})))
    }
}

pub struct UnblockTasksTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for UnblockTasksTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "unblock_tasks",
            "Promote blocked tasks whose dependencies are all done. With task_key, only \
             dependents of that task are considered.",
            json!({
                "type": "object",
                "properties": {"task_key": {"type": "string"}}
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let report = match opt_str_arg(&arguments, "task_key") {
            Some(key) => self.0.unblock_cascade(key).await,
            None => self.0.unblock_all().await,
        }
        .map_err(store_err)?;
        to_output(&report)
    }
}

pub struct RequestReviewTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for RequestReviewTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "request_review",
            "Open a review on a completed task.",
            json!({
                "type": "object",
                "properties": {
                    "task_key": {"type": "string"},
                    "review_type": {"type": "string", "enum": ["quality", "security", "performance", "code"]},
                    "notes": {"type": "string"},
                    "reviewer": {"type": "string"}
                },
                "required": ["task_key"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let key = str_arg(&arguments, "task_key")?;
        let review_type = parse_arg::<ReviewType>(&arguments, "review_type")?.unwrap_or(ReviewType::Code);
        let notes = opt_str_arg(&arguments, "notes").unwrap_or_default();
        let review = self
            .0
            .request_review(key, review_type, notes, opt_str_arg(&arguments, "reviewer"))
            .await
            .map_err(store_err)?;
        to_output(&review)
    }
}

pub struct SubmitReviewTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for SubmitReviewTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "submit_review",
            "Record a review verdict. approved completes the task and unblocks dependents.",
            json!({
                "type": "object",
                "properties": {
                    "review_id": {"type": "integer"},
                    "status": {"type": "string", "enum": ["approved", "needs_changes", "rejected"]},
                    "comments": {"type": "string"},
                    "findings": {"type": "array"},
                    "required_changes": {"type": "array", "items": {"type": "string"}},
                    "reviewer": {"type": "string"}
                },
                "required": ["review_id", "status"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let review_id = arguments
            .get("review_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ToolError::execution("missing required parameter: review_id"))?;
        let status = parse_arg::<ReviewStatus>(&arguments, "status")?
            .ok_or_else(|| ToolError::execution("missing required parameter: status"))?;
        let submission = ReviewSubmission {
            status,
            findings: json_arg::<Vec<ReviewFinding>>(&arguments, "findings")?.unwrap_or_default(),
            comments: opt_str_arg(&arguments, "comments").unwrap_or_default().to_string(),
            required_changes: string_list(&arguments, "required_changes"),
            reviewer: opt_str_arg(&arguments, "reviewer").map(str::to_string),
        };
        let outcome = self
            .0
            .submit_review(review_id, submission)
            .await
            .map_err(store_err)?;
        to_output(&outcome)
    }
}

pub struct UpdateProgressTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for UpdateProgressTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "update_progress",
            "Report progress on a claimed task and move it along the state machine.",
            json!({
                "type": "object",
                "properties": {
                    "task_key": {"type": "string"},
                    "status": {"type": "string", "enum": ["in_progress", "completed"]},
                    "percent": {"type": "integer"},
                    "note": {"type": "string"},
                    "result": {"type": "string"},
                    "artifacts": {"type": "array", "items": {"type": "string"}},
                    "agent": {"type": "string"}
                },
                "required": ["task_key", "status"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let key = str_arg(&arguments, "task_key")?;
        let status = parse_arg::<TaskStatus>(&arguments, "status")?
            .ok_or_else(|| ToolError::execution("missing required parameter: status"))?;
        let update = ProgressUpdate {
            percent: arguments
                .get("percent")
                .and_then(Value::as_u64)
                .map(|p| p.min(100) as u8),
            note: opt_str_arg(&arguments, "note").map(str::to_string),
            result: opt_str_arg(&arguments, "result").map(str::to_string),
            artifacts: string_list(&arguments, "artifacts"),
            agent: opt_str_arg(&arguments, "agent").map(str::to_string),
        };
        let task = self
            .0
            .update_progress(key, status, update)
            .await
            .map_err(store_err)?;
        to_output(&task)
    }
}

pub struct GetQueueTool(pub Arc<TaskStore>);

#[async_trait]
impl Tool for GetQueueTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_queue",
            "List tasks with optional filters plus counts by status.",
            json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": STATUS_VALUES},
                    "assigned_to": {"type": "string"},
                    "task_type": {"type": "string"}
                }
            }),
        )
        .with_capabilities(ToolCapabilities::read_only())
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let filter = QueueFilter {
            status: parse_arg::<TaskStatus>(&arguments, "status")?,
            assigned_to: opt_str_arg(&arguments, "assigned_to").map(str::to_string),
            task_type: opt_str_arg(&arguments, "task_type").map(str::to_string),
        };
        let snapshot = self.0.get_queue(filter).await.map_err(store_err)?;
        to_output(&snapshot)
    }
}
