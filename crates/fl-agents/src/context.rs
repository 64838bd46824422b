//! Per-attempt execution context.
//!
//! A [`TaskContext`] is built once from the claimed task and handed down the
//! call chain by `&mut`. Its identity fields never change after
//! construction; the only mutations are the append operations
//! ([`add_error`](TaskContext::add_error), [`add_created_file`](TaskContext::add_created_file),
//! [`add_modified_file`](TaskContext::add_modified_file)).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fl_core::types::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One failure recorded during an attempt. The history of these is what
/// escalation payloads are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub attempt: u32,
    pub tool: Option<String>,
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(
        attempt: u32,
        tool: Option<&str>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            tool: tool.map(str::to_string),
            error_type: error_type.into(),
            message: message.into(),
            file: None,
            line: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    task_id: i64,
    task_key: String,
    parent_key: Option<String>,
    description: String,
    task_type: String,
    priority: i32,
    project_path: Option<PathBuf>,
    input: Value,
    dependency_keys: Vec<String>,
    dependency_files: Vec<PathBuf>,
    prior_attempts: u32,

    errors: Vec<ExecutionError>,
    created_files: Vec<PathBuf>,
    modified_files: Vec<PathBuf>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskContext {
    pub fn new(task_key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: 0,
            task_key: task_key.into(),
            parent_key: None,
            description: description.into(),
            task_type: "code".into(),
            priority: 0,
            project_path: None,
            input: Value::Null,
            dependency_keys: Vec::new(),
            dependency_files: Vec::new(),
            prior_attempts: 0,
            errors: Vec::new(),
            created_files: Vec::new(),
            modified_files: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Context for a claimed task. `dependencies` are the tasks named in its
    /// `depends_on`; their artifacts become the dependency file list.
    ///
    /// The project path comes from the `project_path` metadata key and the
    /// prior attempt count from `attempts`.
    pub fn from_task(task: &Task, dependencies: &[Task]) -> Self {
        let meta_str = |key: &str| task.metadata.get(key).and_then(Value::as_str);
        let mut ctx = Self::new(&task.key, &task.description)
            .with_task_type(&task.task_type)
            .with_priority(task.priority)
            .with_dependencies(
                task.depends_on.clone(),
                dependencies
                    .iter()
                    .flat_map(|d| d.artifacts.iter().map(PathBuf::from))
                    .collect(),
            )
            .with_prior_attempts(
                task.metadata
                    .get("attempts")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
            );
        ctx.task_id = task.id;
        if let Some(path) = meta_str("project_path") {
            ctx.project_path = Some(PathBuf::from(path));
        }
        if let Some(parent) = meta_str("parent_key") {
            ctx.parent_key = Some(parent.to_string());
        }
        if let Some(input) = task.metadata.get("input") {
            ctx.input = input.clone();
        }
        ctx
    }

    // -- construction -------------------------------------------------------

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent_key = Some(parent_key.into());
        self
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_dependencies(mut self, keys: Vec<String>, files: Vec<PathBuf>) -> Self {
        self.dependency_keys = keys;
        self.dependency_files = files;
        self
    }

    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }

    pub fn parent_key(&self) -> Option<&str> {
        self.parent_key.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn dependency_keys(&self) -> &[String] {
        &self.dependency_keys
    }

    pub fn dependency_files(&self) -> &[PathBuf] {
        &self.dependency_files
    }

    pub fn prior_attempts(&self) -> u32 {
        self.prior_attempts
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.prior_attempts + 1
    }

    pub fn errors(&self) -> &[ExecutionError] {
        &self.errors
    }

    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.errors.last()
    }

    pub fn created_files(&self) -> &[PathBuf] {
        &self.created_files
    }

    pub fn modified_files(&self) -> &[PathBuf] {
        &self.modified_files
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    // -- append-only mutation -----------------------------------------------

    pub fn add_error(&mut self, error: ExecutionError) {
        self.errors.push(error);
    }

    pub fn add_created_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.created_files.contains(&path) {
            self.created_files.push(path);
        }
    }

    /// Files created during this attempt stay in the created list only.
    pub fn add_modified_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.created_files.contains(&path) && !self.modified_files.contains(&path) {
            self.modified_files.push(path);
        }
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
