//! SQLite-backed task queue.
//!
//! All cross-worker mutual exclusion happens here through conditional
//! writes: an `UPDATE ... WHERE status = <expected>` whose affected-row count
//! is the only success signal. No in-process locks are taken, so several
//! processes may share one database file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::dependency::{dedup_keys, find_cycle, DependencyGraph};
use crate::types::{
    FeedbackMessage, Metadata, MessageType, NewTask, ParseEnumError, ReviewFinding,
    ReviewStatus, ReviewType, Task, TaskReview, TaskStatus,
};

/// Sender name used for notifications the store emits on its own behalf.
pub const STORE_SENDER: &str = "task_store";

const DEFAULT_SUPERVISOR: &str = "supervisor";
const DEFAULT_REVIEWER: &str = "reviewer";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a claim did not go through. Always resolved to a concrete reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ClaimConflict {
    #[error("task not found")]
    TaskNotFound,
    #[error("already claimed by {assignee}")]
    AlreadyClaimed { assignee: String },
    #[error("not ready (status: {status})")]
    NotReady { status: TaskStatus },
}

impl ClaimConflict {
    pub fn reason(&self) -> &'static str {
        match self {
            ClaimConflict::TaskNotFound => "task_not_found",
            ClaimConflict::AlreadyClaimed { .. } => "already_claimed",
            ClaimConflict::NotReady { .. } => "not_ready",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("review not found: {0}")]
    ReviewNotFound(i64),
    #[error("claim of {key} failed: {conflict}")]
    ClaimConflict { key: String, conflict: ClaimConflict },
    #[error("invalid state transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {0} was modified concurrently")]
    StaleWrite(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
    #[error("task key already exists: {0}")]
    DuplicateKey(String),
    #[error("dependencies of {0} can no longer change")]
    DependenciesFrozen(String),
    #[error("'{0}' is not a review verdict")]
    InvalidVerdict(ReviewStatus),
    #[error("review {review_id} is not the latest review of {key}")]
    StaleReview { review_id: i64, key: String },
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;

// ---------------------------------------------------------------------------
// Operation parameters and results
// ---------------------------------------------------------------------------

/// Worker-reported progress accompanying a status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub percent: Option<u8>,
    #[serde(default)]
    pub note: Option<String>,
    /// Final result text; recorded when provided.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Agent reporting the update (notification sender).
    #[serde(default)]
    pub agent: Option<String>,
}

impl ProgressUpdate {
    pub fn percent(percent: u8) -> Self {
        Self {
            percent: Some(percent),
            ..Default::default()
        }
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn by(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// A reviewer's verdict on a pending review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub status: ReviewStatus,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub required_changes: Vec<String>,
    #[serde(default)]
    pub reviewer: Option<String>,
}

impl ReviewSubmission {
    pub fn new(status: ReviewStatus, comments: impl Into<String>) -> Self {
        Self {
            status,
            findings: Vec::new(),
            comments: comments.into(),
            required_changes: Vec::new(),
            reviewer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review: TaskReview,
    pub task: Task,
    /// Present when the verdict moved the task to `done`.
    pub unblocked: Option<UnblockReport>,
}

/// Result of one unblock pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnblockReport {
    /// The completed task that triggered the pass; `None` for a full re-scan.
    pub trigger: Option<String>,
    pub promoted: Vec<String>,
    /// Tasks left blocked, with the dependencies still outstanding.
    pub still_blocked: BTreeMap<String, Vec<String>>,
    /// Dependency cycles found while scanning; tasks on them are skipped.
    pub cycles: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub agent: String,
    /// Empty means any type.
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default)]
    pub priority_threshold: i32,
}

fn default_max_tasks() -> usize {
    1
}

impl PollRequest {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task_types: Vec::new(),
            max_tasks: default_max_tasks(),
            priority_threshold: i32::MIN,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tasks: Vec<Task>,
    /// Counts over the whole queue, independent of the filter.
    pub counts_by_status: BTreeMap<TaskStatus, usize>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Durable task queue with claim, state-machine and review operations.
pub struct TaskStore {
    conn: Connection,
    bus: MessageBus,
    supervisor: String,
}

impl TaskStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self::from_connection(conn);
        store.init_schema(busy_timeout).await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self::from_connection(conn);
        store.init_schema(Duration::from_millis(5000)).await?;
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            bus: MessageBus::new(),
            supervisor: DEFAULT_SUPERVISOR.to_string(),
        }
    }

    /// Share an existing bus instead of the store's private one.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = bus;
        self
    }

    /// Name of the supervising layer that receives claim and progress notices.
    pub fn with_supervisor(mut self, name: impl Into<String>) -> Self {
        self.supervisor = name.into();
        self
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn supervisor(&self) -> &str {
        &self.supervisor
    }

    /// Run `f` on the connection thread. The outer `rusqlite::Result` carries
    /// storage failures; the inner one carries domain rejections.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
            .await?
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self, busy_timeout: Duration) -> Result<()> {
        self.call(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA foreign_keys=ON;

                CREATE TABLE IF NOT EXISTS tasks (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_key        TEXT NOT NULL UNIQUE,
                    parent_id       INTEGER,
                    title           TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    task_type       TEXT NOT NULL,
                    priority        INTEGER NOT NULL DEFAULT 0,
                    assigned_to     TEXT,
                    assigned_at     TEXT,
                    dor_criteria    TEXT,
                    dor_met         INTEGER NOT NULL DEFAULT 1,
                    dod_criteria    TEXT,
                    dod_met         INTEGER NOT NULL DEFAULT 0,
                    depends_on      TEXT NOT NULL DEFAULT '[]',
                    status          TEXT NOT NULL,
                    review_status   TEXT,
                    review_comments TEXT,
                    reviewer        TEXT,
                    result          TEXT,
                    artifacts       TEXT NOT NULL DEFAULT '[]',
                    metadata        TEXT NOT NULL DEFAULT '{}',
                    created_at      TEXT NOT NULL,
                    started_at      TEXT,
                    completed_at    TEXT,
                    updated_at      TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_ready
                    ON tasks(status, priority DESC, created_at ASC);

                CREATE TABLE IF NOT EXISTS task_reviews (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id     INTEGER NOT NULL REFERENCES tasks(id),
                    reviewer    TEXT NOT NULL,
                    review_type TEXT NOT NULL,
                    status      TEXT NOT NULL,
                    findings    TEXT NOT NULL DEFAULT '[]',
                    comments    TEXT NOT NULL DEFAULT '',
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_reviews_task ON task_reviews(task_id);

                CREATE TABLE IF NOT EXISTS agent_communications (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    sender       TEXT NOT NULL,
                    receiver     TEXT,
                    message_type TEXT NOT NULL,
                    content      TEXT NOT NULL,
                    context_ref  TEXT,
                    created_at   TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_comms_receiver ON agent_communications(receiver);
                CREATE INDEX IF NOT EXISTS idx_comms_context  ON agent_communications(context_ref);
                ",
            )?;
            Ok(Ok(()))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Creation and readiness
    // -----------------------------------------------------------------------

    /// Create a task. Dependencies must already exist and must not close a
    /// cycle. The initial status is `new` while Definition-of-Ready is unmet,
    /// otherwise `ready` or `blocked` depending on the dependencies.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let dor = new.dor_criteria.as_ref().map(|v| v.to_string());
        let dod = new.dod_criteria.as_ref().map(|v| v.to_string());

        let task = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let deps = dedup_keys(&new.depends_on);

                let key = match new.key.clone() {
                    Some(key) => key,
                    None => allocate_key(&tx)?,
                };
                if task_exists(&tx, &key)? {
                    return Ok(Err(TaskStoreError::DuplicateKey(key)));
                }

                for dep in &deps {
                    if *dep == key {
                        return Ok(Err(TaskStoreError::DependencyCycle(vec![
                            key.clone(),
                            key.clone(),
                        ])));
                    }
                    if !task_exists(&tx, dep)? {
                        return Ok(Err(TaskStoreError::UnknownDependency(dep.clone())));
                    }
                }

                let mut graph = load_graph(&tx)?;
                graph.insert(key.clone(), deps.clone());
                if let Some(cycle) = find_cycle(&graph, &key) {
                    return Ok(Err(TaskStoreError::DependencyCycle(cycle)));
                }

                let remaining = outstanding_deps(&tx, &deps)?;
                let status = if !new.dor_met {
                    TaskStatus::New
                } else if remaining.is_empty() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Blocked
                };

                let mut metadata = new.metadata.clone();
                if status == TaskStatus::Blocked {
                    metadata.insert("blocked_on".into(), serde_json::json!(remaining));
                }

                let now = now_ts();
                tx.execute(
                    "INSERT INTO tasks (task_key, parent_id, title, description, task_type,
                        priority, dor_criteria, dor_met, dod_criteria, dod_met, depends_on,
                        status, artifacts, metadata, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,0,?10,?11,'[]',?12,?13,?13)",
                    params![
                        key,
                        new.parent_id,
                        new.title,
                        new.description,
                        new.task_type,
                        new.priority,
                        dor,
                        new.dor_met,
                        dod,
                        to_json(&deps)?,
                        status.as_str(),
                        to_json(&metadata)?,
                        now,
                    ],
                )?;
                let task = load_task(&tx, &key)?;
                tx.commit()?;
                Ok(task.ok_or(TaskStoreError::TaskNotFound(key)))
            })
            .await?;

        info!(
            task_key = %task.key,
            status = %task.status,
            deps = task.depends_on.len(),
            "task created"
        );
        self.notify(
            FeedbackMessage::new(
                STORE_SENDER,
                None,
                MessageType::TaskCreated,
                format!("{} created: {} [{}]", task.key, task.title, task.status),
            )
            .about(&task.key),
        )
        .await;
        Ok(task)
    }

    /// Mark Definition-of-Ready as met and move a `new` task to `ready` (or
    /// `blocked` when dependencies are outstanding).
    pub async fn mark_ready(&self, key: &str) -> Result<Task> {
        let key = key.to_string();
        let task = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(task) = load_task(&tx, &key)? else {
                    return Ok(Err(TaskStoreError::TaskNotFound(key)));
                };
                if task.status != TaskStatus::New {
                    if task.dor_met && matches!(task.status, TaskStatus::Ready | TaskStatus::Blocked)
                    {
                        return Ok(Ok(task));
                    }
                    return Ok(Err(TaskStoreError::InvalidTransition {
                        key,
                        from: task.status,
                        to: TaskStatus::Ready,
                    }));
                }

                let remaining = outstanding_deps(&tx, &task.depends_on)?;
                let mut metadata = task.metadata.clone();
                let status = if remaining.is_empty() {
                    metadata.remove("blocked_on");
                    TaskStatus::Ready
                } else {
                    metadata.insert("blocked_on".into(), serde_json::json!(remaining));
                    TaskStatus::Blocked
                };
                let changed = tx.execute(
                    "UPDATE tasks SET dor_met = 1, status = ?2, metadata = ?3, updated_at = ?4
                     WHERE task_key = ?1 AND status = 'new'",
                    params![key, status.as_str(), to_json(&metadata)?, now_ts()],
                )?;
                if changed == 0 {
                    return Ok(Err(TaskStoreError::StaleWrite(key)));
                }
                let task = load_task(&tx, &key)?;
                tx.commit()?;
                Ok(task.ok_or(TaskStoreError::TaskNotFound(key)))
            })
            .await?;
        debug!(task_key = %task.key, status = %task.status, "definition of ready met");
        Ok(task)
    }

    /// Add `dep` to the dependency set of `key`. Only tasks that have not been
    /// claimed yet accept new dependencies.
    pub async fn add_dependency(&self, key: &str, dep: &str) -> Result<Task> {
        let key = key.to_string();
        let dep = dep.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(task) = load_task(&tx, &key)? else {
                return Ok(Err(TaskStoreError::TaskNotFound(key)));
            };
            if !task_exists(&tx, &dep)? {
                return Ok(Err(TaskStoreError::UnknownDependency(dep)));
            }
            if !matches!(
                task.status,
                TaskStatus::New | TaskStatus::Ready | TaskStatus::Blocked
            ) {
                return Ok(Err(TaskStoreError::DependenciesFrozen(key)));
            }
            if task.depends_on.contains(&dep) {
                return Ok(Ok(task));
            }

            let mut deps = task.depends_on.clone();
            deps.push(dep);
            let mut graph = load_graph(&tx)?;
            graph.insert(key.clone(), deps.clone());
            if let Some(cycle) = find_cycle(&graph, &key) {
                return Ok(Err(TaskStoreError::DependencyCycle(cycle)));
            }

            let remaining = outstanding_deps(&tx, &deps)?;
            let mut metadata = task.metadata.clone();
            let status = match task.status {
                TaskStatus::Ready | TaskStatus::Blocked if !remaining.is_empty() => {
                    metadata.insert("blocked_on".into(), serde_json::json!(remaining));
                    TaskStatus::Blocked
                }
                other => other,
            };
            let changed = tx.execute(
                "UPDATE tasks SET depends_on = ?2, status = ?3, metadata = ?4, updated_at = ?5
                 WHERE task_key = ?1 AND status = ?6",
                params![
                    key,
                    to_json(&deps)?,
                    status.as_str(),
                    to_json(&metadata)?,
                    now_ts(),
                    task.status.as_str(),
                ],
            )?;
            if changed == 0 {
                return Ok(Err(TaskStoreError::StaleWrite(key)));
            }
            let task = load_task(&tx, &key)?;
            tx.commit()?;
            Ok(task.ok_or(TaskStoreError::TaskNotFound(key)))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Atomically move a `ready` task to `claimed` for `agent`.
    ///
    /// The conditional update's affected-row count decides the outcome; the
    /// follow-up read only classifies a lost claim.
    pub async fn claim(&self, key: &str, agent: &str) -> Result<Task> {
        let key_owned = key.to_string();
        let agent_owned = agent.to_string();
        let (won, current) = self
            .call(move |conn| {
                let now = now_ts();
                let changed = conn.execute(
                    "UPDATE tasks
                     SET status = 'claimed', assigned_to = ?2, assigned_at = ?3, updated_at = ?3
                     WHERE task_key = ?1 AND status = 'ready'",
                    params![key_owned, agent_owned, now],
                )?;
                let current = load_task(conn, &key_owned)?;
                Ok(Ok((changed == 1, current)))
            })
            .await?;

        match (won, current) {
            (true, Some(task)) => {
                info!(task_key = %task.key, agent = %agent, "task claimed");
                self.notify(
                    FeedbackMessage::new(
                        agent,
                        Some(self.supervisor.clone()),
                        MessageType::TaskClaimed,
                        format!("{} claimed {}: {}", agent, task.key, task.title),
                    )
                    .about(&task.key),
                )
                .await;
                Ok(task)
            }
            (_, current) => {
                let conflict = match current {
                    None => ClaimConflict::TaskNotFound,
                    Some(task) => match task.assigned_to {
                        Some(assignee) if task.status != TaskStatus::Ready => {
                            ClaimConflict::AlreadyClaimed { assignee }
                        }
                        _ => ClaimConflict::NotReady {
                            status: task.status,
                        },
                    },
                };
                warn!(task_key = %key, agent = %agent, reason = conflict.reason(), "claim rejected");
                Err(TaskStoreError::ClaimConflict {
                    key: key.to_string(),
                    conflict,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Apply a worker-reported status change.
    ///
    /// Allowed: `claimed -> in_progress`, `in_progress -> in_progress`,
    /// `in_progress -> completed`, `needs_changes -> in_progress`.
    pub async fn update_progress(
        &self,
        key: &str,
        to: TaskStatus,
        update: ProgressUpdate,
    ) -> Result<Task> {
        let key_owned = key.to_string();
        let progress = update.clone();
        let result = self
            .call(move |conn| {
                let key = key_owned;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(task) = load_task(&tx, &key)? else {
                    return Ok(Err(TaskStoreError::TaskNotFound(key)));
                };
                let from = task.status;
                if !from.can_progress_to(to) {
                    return Ok(Err(TaskStoreError::InvalidTransition { key, from, to }));
                }

                let now = Utc::now();
                let mut metadata = task.metadata.clone();
                let percent = match (progress.percent, to) {
                    (Some(p), _) => Some(p.min(100)),
                    (None, TaskStatus::Completed) => Some(100),
                    (None, _) => None,
                };
                if let Some(p) = percent {
                    metadata.insert("progress_percent".into(), serde_json::json!(p));
                }
                if let Some(note) = &progress.note {
                    metadata.insert("progress_note".into(), serde_json::json!(note));
                }
                metadata.insert("progress_updated_at".into(), serde_json::json!(ts(&now)));

                let started_at = match (to, task.started_at) {
                    (TaskStatus::InProgress, None) => Some(now),
                    (_, started) => started,
                };
                let completed_at = match to {
                    TaskStatus::Completed => Some(now),
                    TaskStatus::InProgress if from == TaskStatus::NeedsChanges => None,
                    _ => task.completed_at,
                };
                let result = progress.result.clone().or(task.result.clone());
                let mut artifacts = task.artifacts.clone();
                artifacts.extend(progress.artifacts.iter().cloned());
                let artifacts = dedup_keys(&artifacts);

                let changed = tx.execute(
                    "UPDATE tasks
                     SET status = ?2, metadata = ?3, started_at = ?4, completed_at = ?5,
                         result = ?6, artifacts = ?7, updated_at = ?8
                     WHERE task_key = ?1 AND status = ?9",
                    params![
                        key,
                        to.as_str(),
                        to_json(&metadata)?,
                        started_at.as_ref().map(ts),
                        completed_at.as_ref().map(ts),
                        result,
                        to_json(&artifacts)?,
                        ts(&now),
                        from.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Ok(Err(TaskStoreError::StaleWrite(key)));
                }
                let task = load_task(&tx, &key)?;
                tx.commit()?;
                Ok(task.map(|t| (from, t)).ok_or(TaskStoreError::TaskNotFound(key)))
            })
            .await;

        let (from, task) = match result {
            Ok(ok) => ok,
            Err(e) => {
                if let TaskStoreError::InvalidTransition { from, to, .. } = &e {
                    warn!(task_key = %key, from = %from, to = %to, "rejected progress transition");
                }
                return Err(e);
            }
        };

        debug!(task_key = %task.key, from = %from, to = %to, "progress updated");
        let mut content = format!("{} {}", task.key, to);
        if let Some(p) = task.progress_percent() {
            content.push_str(&format!(" ({p}%)"));
        }
        if let Some(note) = &update.note {
            content.push_str(&format!(": {note}"));
        }
        let sender = update
            .agent
            .clone()
            .or_else(|| task.assigned_to.clone())
            .unwrap_or_else(|| STORE_SENDER.to_string());
        self.notify(
            FeedbackMessage::new(
                sender,
                Some(self.supervisor.clone()),
                MessageType::ProgressUpdate,
                content,
            )
            .about(&task.key),
        )
        .await;
        Ok(task)
    }

    /// Merge keys into a task's metadata bag (last write wins per key).
    pub async fn merge_metadata(&self, key: &str, patch: Metadata) -> Result<Task> {
        let key = key.to_string();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(task) = load_task(&tx, &key)? else {
                return Ok(Err(TaskStoreError::TaskNotFound(key)));
            };
            let mut metadata = task.metadata;
            metadata.extend(patch);
            tx.execute(
                "UPDATE tasks SET metadata = ?2, updated_at = ?3 WHERE task_key = ?1",
                params![key, to_json(&metadata)?, now_ts()],
            )?;
            let task = load_task(&tx, &key)?;
            tx.commit()?;
            Ok(task.ok_or(TaskStoreError::TaskNotFound(key)))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Review workflow
    // -----------------------------------------------------------------------

    /// Open a review cycle on a `completed` task and move it to `in_review`.
    pub async fn request_review(
        &self,
        key: &str,
        review_type: ReviewType,
        notes: &str,
        reviewer: Option<&str>,
    ) -> Result<TaskReview> {
        let key_owned = key.to_string();
        let notes = notes.to_string();
        let reviewer = reviewer.unwrap_or(DEFAULT_REVIEWER).to_string();
        let reviewer_for_row = reviewer.clone();
        let review = self
            .call(move |conn| {
                let key = key_owned;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(task) = load_task(&tx, &key)? else {
                    return Ok(Err(TaskStoreError::TaskNotFound(key)));
                };
                if task.status != TaskStatus::Completed {
                    return Ok(Err(TaskStoreError::InvalidTransition {
                        key,
                        from: task.status,
                        to: TaskStatus::InReview,
                    }));
                }

                let now = now_ts();
                tx.execute(
                    "INSERT INTO task_reviews (task_id, reviewer, review_type, status, findings,
                        comments, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'pending', '[]', ?4, ?5, ?5)",
                    params![task.id, reviewer_for_row, review_type.as_str(), notes, now],
                )?;
                let review_id = tx.last_insert_rowid();
                let changed = tx.execute(
                    "UPDATE tasks
                     SET status = 'in_review', review_status = 'pending', reviewer = ?2,
                         updated_at = ?3
                     WHERE task_key = ?1 AND status = 'completed'",
                    params![key, reviewer_for_row, now],
                )?;
                if changed == 0 {
                    return Ok(Err(TaskStoreError::StaleWrite(key)));
                }
                let review = load_review(&tx, review_id)?;
                tx.commit()?;
                Ok(review.ok_or(TaskStoreError::ReviewNotFound(review_id)))
            })
            .await?;

        info!(task_key = %key, review_id = review.id, reviewer = %reviewer, "review requested");
        self.notify(
            FeedbackMessage::new(
                STORE_SENDER,
                Some(reviewer),
                MessageType::ReviewRequested,
                format!(
                    "{} review requested for {}: {}",
                    review.review_type, key, review.comments
                ),
            )
            .about(key),
        )
        .await;
        Ok(review)
    }

    /// Record a reviewer's verdict and move the task accordingly:
    /// approved -> done (then the unblock cascade runs), needs_changes ->
    /// needs_changes, rejected -> rejected.
    pub async fn submit_review(
        &self,
        review_id: i64,
        submission: ReviewSubmission,
    ) -> Result<ReviewOutcome> {
        let Some(target) = submission.status.task_status() else {
            return Err(TaskStoreError::InvalidVerdict(submission.status));
        };
        let sub = submission.clone();
        let (review, task) = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(review) = load_review(&tx, review_id)? else {
                    return Ok(Err(TaskStoreError::ReviewNotFound(review_id)));
                };
                let key = review.task_key.clone();
                let Some(task) = load_task(&tx, &key)? else {
                    return Ok(Err(TaskStoreError::TaskNotFound(key)));
                };
                let latest: i64 = tx.query_row(
                    "SELECT MAX(id) FROM task_reviews WHERE task_id = ?1",
                    params![task.id],
                    |row| row.get(0),
                )?;
                if latest != review_id {
                    return Ok(Err(TaskStoreError::StaleReview { review_id, key }));
                }
                if task.status != TaskStatus::InReview {
                    return Ok(Err(TaskStoreError::InvalidTransition {
                        key,
                        from: task.status,
                        to: target,
                    }));
                }

                let now = now_ts();
                let reviewer = sub.reviewer.clone().unwrap_or(review.reviewer.clone());
                tx.execute(
                    "UPDATE task_reviews
                     SET status = ?2, findings = ?3, comments = ?4, reviewer = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        review_id,
                        sub.status.as_str(),
                        to_json(&sub.findings)?,
                        sub.comments,
                        reviewer,
                        now,
                    ],
                )?;

                let mut metadata = task.metadata.clone();
                if sub.status == ReviewStatus::NeedsChanges {
                    metadata.insert(
                        "required_changes".into(),
                        serde_json::json!(sub.required_changes),
                    );
                }
                let approved = sub.status == ReviewStatus::Approved;
                let changed = tx.execute(
                    "UPDATE tasks
                     SET status = ?2, review_status = ?3, review_comments = ?4, reviewer = ?5,
                         metadata = ?6,
                         dod_met = CASE WHEN ?7 THEN 1 ELSE dod_met END,
                         completed_at = CASE WHEN ?7 THEN ?8 ELSE completed_at END,
                         updated_at = ?8
                     WHERE task_key = ?1 AND status = 'in_review'",
                    params![
                        key,
                        target.as_str(),
                        sub.status.as_str(),
                        sub.comments,
                        reviewer,
                        to_json(&metadata)?,
                        approved,
                        now,
                    ],
                )?;
                if changed == 0 {
                    return Ok(Err(TaskStoreError::StaleWrite(key)));
                }
                let review = load_review(&tx, review_id)?;
                let task = load_task(&tx, &key)?;
                tx.commit()?;
                match (review, task) {
                    (Some(r), Some(t)) => Ok(Ok((r, t))),
                    (None, _) => Ok(Err(TaskStoreError::ReviewNotFound(review_id))),
                    (_, None) => Ok(Err(TaskStoreError::TaskNotFound(key))),
                }
            })
            .await?;

        info!(
            task_key = %task.key,
            review_id,
            verdict = %submission.status,
            status = %task.status,
            "review submitted"
        );

        let unblocked = if task.status == TaskStatus::Done {
            Some(self.unblock_cascade(&task.key).await?)
        } else {
            None
        };

        self.notify(
            FeedbackMessage::new(
                review.reviewer.clone(),
                task.assigned_to.clone(),
                MessageType::ReviewSubmitted,
                review_summary(&task, &review, &submission.required_changes),
            )
            .about(&task.key),
        )
        .await;

        Ok(ReviewOutcome {
            review,
            task,
            unblocked,
        })
    }

    // -----------------------------------------------------------------------
    // Unblock cascade
    // -----------------------------------------------------------------------

    /// Promote every blocked task that depends on `completed_key` and whose
    /// whole dependency set is now `done`. Re-running without new completions
    /// changes nothing.
    pub async fn unblock_cascade(&self, completed_key: &str) -> Result<UnblockReport> {
        self.reevaluate_blocked(Some(completed_key.to_string())).await
    }

    /// Re-check every blocked task regardless of what completed.
    pub async fn unblock_all(&self) -> Result<UnblockReport> {
        self.reevaluate_blocked(None).await
    }

    async fn reevaluate_blocked(&self, trigger: Option<String>) -> Result<UnblockReport> {
        let trigger_for_scan = trigger.clone();
        let report = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let blocked: Vec<Task> = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'blocked' ORDER BY id"
                    ))?;
                    let rows = stmt.query_map([], row_to_task)?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                let graph = load_graph(&tx)?;
                let mut report = UnblockReport {
                    trigger: trigger_for_scan.clone(),
                    ..Default::default()
                };

                for task in blocked {
                    if let Some(trigger) = &trigger_for_scan {
                        if !task.depends_on.contains(trigger) {
                            continue;
                        }
                    }

                    let mut metadata = task.metadata.clone();
                    if let Some(cycle) = find_cycle(&graph, &task.key) {
                        warn!(task_key = %task.key, cycle = %cycle.join(" -> "), "dependency cycle, skipping");
                        let value = serde_json::json!(cycle);
                        if metadata.get("dependency_cycle") != Some(&value) {
                            metadata.insert("dependency_cycle".into(), value);
                            write_metadata(&tx, &task.key, &metadata)?;
                        }
                        report.cycles.push(cycle);
                        continue;
                    }

                    let remaining = outstanding_deps(&tx, &task.depends_on)?;
                    if remaining.is_empty() {
                        metadata.remove("blocked_on");
                        let changed = tx.execute(
                            "UPDATE tasks SET status = 'ready', metadata = ?2, updated_at = ?3
                             WHERE task_key = ?1 AND status = 'blocked'",
                            params![task.key, to_json(&metadata)?, now_ts()],
                        )?;
                        if changed == 1 {
                            report.promoted.push(task.key.clone());
                        }
                    } else {
                        let value = serde_json::json!(remaining);
                        if metadata.get("blocked_on") != Some(&value) {
                            metadata.insert("blocked_on".into(), value);
                            write_metadata(&tx, &task.key, &metadata)?;
                        }
                        report.still_blocked.insert(task.key.clone(), remaining);
                    }
                }
                tx.commit()?;
                Ok(Ok(report))
            })
            .await?;

        if !report.promoted.is_empty() || !report.still_blocked.is_empty() {
            info!(
                trigger = trigger.as_deref().unwrap_or("*"),
                promoted = report.promoted.len(),
                still_blocked = report.still_blocked.len(),
                "unblock pass finished"
            );
        }
        for key in &report.promoted {
            let content = match &trigger {
                Some(t) => format!("{key} is ready: {t} completed its last dependency"),
                None => format!("{key} is ready: all dependencies done"),
            };
            self.notify(
                FeedbackMessage::new(STORE_SENDER, None, MessageType::TaskUnblocked, content)
                    .about(key),
            )
            .await;
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Up to `max_tasks` claimable tasks, highest priority first then oldest,
    /// with every dependency re-verified as `done` at read time.
    pub async fn poll(&self, request: PollRequest) -> Result<Vec<Task>> {
        let req = request.clone();
        let tasks = self
            .call(move |conn| {
                let candidates: Vec<Task> = {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks
                         WHERE status = 'ready' AND dor_met = 1 AND priority >= ?1
                         ORDER BY priority DESC, created_at ASC, id ASC"
                    ))?;
                    let rows = stmt.query_map(params![req.priority_threshold], row_to_task)?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                let mut out = Vec::new();
                for task in candidates {
                    if out.len() >= req.max_tasks {
                        break;
                    }
                    if !req.task_types.is_empty() && !req.task_types.contains(&task.task_type) {
                        continue;
                    }
                    let remaining = outstanding_deps(conn, &task.depends_on)?;
                    if !remaining.is_empty() {
                        debug!(
                            task_key = %task.key,
                            remaining = ?remaining,
                            "ready task has outstanding dependencies, skipping"
                        );
                        continue;
                    }
                    out.push(task);
                }
                Ok(Ok(out))
            })
            .await?;
        debug!(agent = %request.agent, found = tasks.len(), "poll");
        Ok(tasks)
    }

    pub async fn get_task(&self, key: &str) -> Result<Option<Task>> {
        let key = key.to_string();
        self.call(move |conn| Ok(Ok(load_task(conn, &key)?))).await
    }

    /// Like [`get_task`](Self::get_task) but a missing task is an error.
    pub async fn task(&self, key: &str) -> Result<Task> {
        self.get_task(key)
            .await?
            .ok_or_else(|| TaskStoreError::TaskNotFound(key.to_string()))
    }

    /// Filtered task list plus per-status counts over the whole queue.
    pub async fn get_queue(&self, filter: QueueFilter) -> Result<QueueSnapshot> {
        self.call(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            if let Some(status) = filter.status {
                values.push(status.as_str().to_string());
                clauses.push(format!("status = ?{}", values.len()));
            }
            if let Some(assignee) = filter.assigned_to {
                values.push(assignee);
                clauses.push(format!("assigned_to = ?{}", values.len()));
            }
            if let Some(task_type) = filter.task_type {
                values.push(task_type);
                clauses.push(format!("task_type = ?{}", values.len()));
            }
            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let tasks: Vec<Task> = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
                     ORDER BY priority DESC, id ASC"
                ))?;
                let rows = stmt.query_map(params_from_iter(values.iter()), row_to_task)?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut counts = BTreeMap::new();
            let mut total = 0;
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                counts.insert(parse_enum::<TaskStatus>(0, &status)?, count as usize);
                total += count as usize;
            }

            Ok(Ok(QueueSnapshot {
                tasks,
                counts_by_status: counts,
                total,
            }))
        })
        .await
    }

    pub async fn get_review(&self, review_id: i64) -> Result<Option<TaskReview>> {
        self.call(move |conn| Ok(Ok(load_review(conn, review_id)?)))
            .await
    }

    /// Every review of a task, newest first.
    pub async fn reviews_for(&self, key: &str) -> Result<Vec<TaskReview>> {
        let key = key.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REVIEW_COLUMNS} FROM task_reviews r JOIN tasks t ON t.id = r.task_id
                 WHERE t.task_key = ?1 ORDER BY r.id DESC"
            ))?;
            let rows = stmt.query_map(params![key], row_to_review)?;
            Ok(Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?))
        })
        .await
    }

    /// The authoritative (most recent) review of a task.
    pub async fn latest_review(&self, key: &str) -> Result<Option<TaskReview>> {
        Ok(self.reviews_for(key).await?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Communication log
    // -----------------------------------------------------------------------

    /// Persist a message and publish it on the bus.
    pub async fn log_message(&self, msg: FeedbackMessage) -> Result<FeedbackMessage> {
        let mut msg = msg;
        let row = msg.clone();
        let id = self
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_communications
                        (sender, receiver, message_type, content, context_ref, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.sender,
                        row.receiver,
                        row.message_type.as_str(),
                        row.content,
                        row.context_ref,
                        ts(&row.timestamp),
                    ],
                )?;
                Ok(Ok(conn.last_insert_rowid()))
            })
            .await?;
        msg.id = id;
        self.bus.publish(msg.clone());
        Ok(msg)
    }

    /// Messages addressed to `receiver` plus broadcasts, newest first.
    pub async fn messages_for(&self, receiver: &str, limit: usize) -> Result<Vec<FeedbackMessage>> {
        let receiver = receiver.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM agent_communications
                 WHERE receiver = ?1 OR receiver IS NULL
                 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![receiver, limit as i64], row_to_message)?;
            Ok(Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?))
        })
        .await
    }

    /// Messages referencing `context_ref` (usually a task key), oldest first.
    pub async fn messages_about(&self, context_ref: &str) -> Result<Vec<FeedbackMessage>> {
        let context_ref = context_ref.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM agent_communications
                 WHERE context_ref = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![context_ref], row_to_message)?;
            Ok(Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?))
        })
        .await
    }

    async fn notify(&self, msg: FeedbackMessage) {
        if let Err(e) = self.log_message(msg).await {
            warn!(error = %e, "failed to record notification");
        }
    }
}

fn review_summary(task: &Task, review: &TaskReview, required_changes: &[String]) -> String {
    let mut out = format!(
        "{} review of {} by {}: {} ({} finding(s))",
        review.review_type,
        task.key,
        review.reviewer,
        review.status,
        review.findings.len()
    );
    if !review.comments.is_empty() {
        out.push_str(&format!(". {}", review.comments));
    }
    if !required_changes.is_empty() {
        out.push_str(&format!(". Required changes: {}", required_changes.join("; ")));
    }
    out
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, task_key, parent_id, title, description, task_type, priority,
    assigned_to, assigned_at, dor_criteria, dor_met, dod_criteria, dod_met, depends_on,
    status, review_status, review_comments, reviewer, result, artifacts, metadata,
    created_at, started_at, completed_at, updated_at";

const REVIEW_COLUMNS: &str = "r.id, r.task_id, t.task_key, r.reviewer, r.review_type, r.status,
    r.findings, r.comments, r.created_at";

const MESSAGE_COLUMNS: &str =
    "id, sender, receiver, message_type, content, context_ref, created_at";

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(&Utc::now())
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_enum<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_err(idx, e))
}

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let dor_criteria: Option<String> = row.get(9)?;
    let dod_criteria: Option<String> = row.get(11)?;
    let depends_on: String = row.get(13)?;
    let status: String = row.get(14)?;
    let review_status: Option<String> = row.get(15)?;
    let artifacts: String = row.get(19)?;
    let metadata: String = row.get(20)?;
    let created_at: String = row.get(21)?;
    let updated_at: String = row.get(24)?;

    Ok(Task {
        id: row.get(0)?,
        key: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        task_type: row.get(5)?,
        priority: row.get(6)?,
        assigned_to: row.get(7)?,
        assigned_at: parse_opt_ts(8, row.get(8)?)?,
        dor_criteria: dor_criteria.map(|s| parse_json(9, &s)).transpose()?,
        dor_met: row.get(10)?,
        dod_criteria: dod_criteria.map(|s| parse_json(11, &s)).transpose()?,
        dod_met: row.get(12)?,
        depends_on: parse_json(13, &depends_on)?,
        status: parse_enum(14, &status)?,
        review_status: review_status.map(|s| parse_enum(15, &s)).transpose()?,
        review_comments: row.get(16)?,
        reviewer: row.get(17)?,
        result: row.get(18)?,
        artifacts: parse_json(19, &artifacts)?,
        metadata: parse_json(20, &metadata)?,
        created_at: parse_ts(21, &created_at)?,
        started_at: parse_opt_ts(22, row.get(22)?)?,
        completed_at: parse_opt_ts(23, row.get(23)?)?,
        updated_at: parse_ts(24, &updated_at)?,
    })
}

fn row_to_review(row: &Row<'_>) -> rusqlite::Result<TaskReview> {
    let review_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    let findings: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(TaskReview {
        id: row.get(0)?,
        task_id: row.get(1)?,
        task_key: row.get(2)?,
        reviewer: row.get(3)?,
        review_type: parse_enum(4, &review_type)?,
        status: parse_enum(5, &status)?,
        findings: parse_json(6, &findings)?,
        comments: row.get(7)?,
        created_at: parse_ts(8, &created_at)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<FeedbackMessage> {
    let message_type: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    Ok(FeedbackMessage {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        message_type: parse_enum(3, &message_type)?,
        content: row.get(4)?,
        context_ref: row.get(5)?,
        timestamp: parse_ts(6, &created_at)?,
    })
}

fn load_task(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_key = ?1"),
        params![key],
        row_to_task,
    )
    .optional()
}

fn load_review(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<TaskReview>> {
    conn.query_row(
        &format!(
            "SELECT {REVIEW_COLUMNS} FROM task_reviews r JOIN tasks t ON t.id = r.task_id
             WHERE r.id = ?1"
        ),
        params![id],
        row_to_review,
    )
    .optional()
}

fn task_exists(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_key = ?1)",
        params![key],
        |row| row.get(0),
    )
}

fn allocate_key(conn: &rusqlite::Connection) -> rusqlite::Result<String> {
    let mut next: i64 =
        conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM tasks", [], |row| row.get(0))?;
    loop {
        let key = format!("TASK-{next:03}");
        if !task_exists(conn, &key)? {
            return Ok(key);
        }
        next += 1;
    }
}

fn load_graph(conn: &rusqlite::Connection) -> rusqlite::Result<DependencyGraph> {
    let mut stmt = conn.prepare("SELECT task_key, depends_on FROM tasks")?;
    let mut rows = stmt.query([])?;
    let mut graph = HashMap::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let deps: String = row.get(1)?;
        graph.insert(key, parse_json(1, &deps)?);
    }
    Ok(graph)
}

/// Dependencies of the given set that are not `done` (missing keys count as
/// outstanding), in dependency order.
fn outstanding_deps(conn: &rusqlite::Connection, deps: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut remaining = Vec::new();
    for dep in deps {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_key = ?1",
                params![dep],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(TaskStatus::Done.as_str()) {
            remaining.push(dep.clone());
        }
    }
    Ok(remaining)
}

fn write_metadata(conn: &rusqlite::Connection, key: &str, metadata: &Metadata) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tasks SET metadata = ?2, updated_at = ?3 WHERE task_key = ?1",
        params![key, to_json(metadata)?, now_ts()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
