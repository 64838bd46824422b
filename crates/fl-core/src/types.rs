use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Parse error for enums stored as text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task in the queue.
///
/// ```text
/// new -> ready -> claimed -> in_progress -> completed -> in_review
///                                 ^                          |
///                                 |                          +-> done (approved)
///                                 +------ needs_changes <----+
///                                                            +-> rejected
/// ```
///
/// `blocked` is orthogonal: a task with unmet dependencies sits there until
/// the unblock cascade promotes it to `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Ready,
    Blocked,
    Claimed,
    InProgress,
    Completed,
    InReview,
    NeedsChanges,
    Done,
    Rejected,
}

text_enum!(TaskStatus, "task status", {
    New => "new",
    Ready => "ready",
    Blocked => "blocked",
    Claimed => "claimed",
    InProgress => "in_progress",
    Completed => "completed",
    InReview => "in_review",
    NeedsChanges => "needs_changes",
    Done => "done",
    Rejected => "rejected",
});

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::New,
        TaskStatus::Ready,
        TaskStatus::Blocked,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::InReview,
        TaskStatus::NeedsChanges,
        TaskStatus::Done,
        TaskStatus::Rejected,
    ];

    /// Returns `true` when a worker-reported progress update may move a task
    /// from `self` to `target`.
    ///
    /// Every other edge of the lifecycle is owned by a dedicated operation
    /// (claim, review, unblock) and is never reachable through progress
    /// updates.
    pub fn can_progress_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Claimed, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::NeedsChanges, TaskStatus::InProgress)
        )
    }

    /// States from which a task never moves again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Rejected)
    }
}

// ---------------------------------------------------------------------------
// Review enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Quality,
    Security,
    Performance,
    Code,
}

text_enum!(ReviewType, "review type", {
    Quality => "quality",
    Security => "security",
    Performance => "performance",
    Code => "code",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    NeedsChanges,
    Rejected,
}

text_enum!(ReviewStatus, "review status", {
    Pending => "pending",
    Approved => "approved",
    NeedsChanges => "needs_changes",
    Rejected => "rejected",
});

impl ReviewStatus {
    /// Task status a submitted review verdict moves the task into.
    /// `Pending` is not a verdict and has no mapping.
    pub fn task_status(&self) -> Option<TaskStatus> {
        match self {
            ReviewStatus::Pending => None,
            ReviewStatus::Approved => Some(TaskStatus::Done),
            ReviewStatus::NeedsChanges => Some(TaskStatus::NeedsChanges),
            ReviewStatus::Rejected => Some(TaskStatus::Rejected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A single issue raised during review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub category: String,
    pub severity: FindingSeverity,
    pub issue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One review cycle of a task. Only the newest review of a task is
/// authoritative for its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReview {
    pub id: i64,
    pub task_id: i64,
    pub task_key: String,
    pub reviewer: String,
    pub review_type: ReviewType,
    pub status: ReviewStatus,
    pub findings: Vec<ReviewFinding>,
    pub comments: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub key: String,
    pub parent_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i32,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub dor_criteria: Option<serde_json::Value>,
    pub dor_met: bool,
    pub dod_criteria: Option<serde_json::Value>,
    pub dod_met: bool,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub review_status: Option<ReviewStatus>,
    pub review_comments: Option<String>,
    pub reviewer: Option<String>,
    pub result: Option<String>,
    pub artifacts: Vec<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Last reported progress percentage, if any.
    pub fn progress_percent(&self) -> Option<u8> {
        self.metadata
            .get("progress_percent")
            .and_then(|v| v.as_u64())
            .map(|v| v.min(100) as u8)
    }

    /// Dependencies that were still outstanding at the last cascade pass.
    pub fn blocked_on(&self) -> Vec<String> {
        self.metadata
            .get("blocked_on")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Explicit key; when absent the store allocates `TASK-NNN`.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub dor_criteria: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub dor_met: bool,
    #[serde(default)]
    pub dod_criteria: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_task_type() -> String {
    "code".into()
}

fn default_true() -> bool {
    true
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            task_type: default_task_type(),
            dor_met: true,
            ..Default::default()
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Attach Definition-of-Ready criteria that are not yet satisfied; the
    /// task is created in `new` and waits for [`mark_ready`].
    ///
    /// [`mark_ready`]: crate::task_store::TaskStore::mark_ready
    pub fn pending_readiness(mut self, criteria: serde_json::Value) -> Self {
        self.dor_criteria = Some(criteria);
        self.dor_met = false;
        self
    }

    pub fn done_criteria(mut self, criteria: serde_json::Value) -> Self {
        self.dod_criteria = Some(criteria);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Agent communication log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskCreated,
    TaskClaimed,
    ProgressUpdate,
    ReviewRequested,
    ReviewSubmitted,
    TaskUnblocked,
    Escalation,
    Notification,
}

text_enum!(MessageType, "message type", {
    TaskCreated => "task_created",
    TaskClaimed => "task_claimed",
    ProgressUpdate => "progress_update",
    ReviewRequested => "review_requested",
    ReviewSubmitted => "review_submitted",
    TaskUnblocked => "task_unblocked",
    Escalation => "escalation",
    Notification => "notification",
});

/// Append-only communication log entry. A `None` receiver is a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMessage {
    /// Storage id; `0` until persisted.
    pub id: i64,
    pub sender: String,
    pub receiver: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub context_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackMessage {
    pub fn new(
        sender: impl Into<String>,
        receiver: Option<String>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            sender: sender.into(),
            receiver,
            message_type,
            content: content.into(),
            context_ref: None,
            timestamp: Utc::now(),
        }
    }

    pub fn about(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("finished".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_and_text_forms_agree() {
        let json = serde_json::to_string(&TaskStatus::NeedsChanges).unwrap();
        assert_eq!(json, "\"needs_changes\"");
        assert_eq!(TaskStatus::NeedsChanges.as_str(), "needs_changes");
    }

    #[test]
    fn review_verdicts_map_to_task_states() {
        assert_eq!(ReviewStatus::Approved.task_status(), Some(TaskStatus::Done));
        assert_eq!(
            ReviewStatus::NeedsChanges.task_status(),
            Some(TaskStatus::NeedsChanges)
        );
        assert_eq!(ReviewStatus::Rejected.task_status(), Some(TaskStatus::Rejected));
        assert_eq!(ReviewStatus::Pending.task_status(), None);
    }

    #[test]
    fn new_task_defaults() {
        let t = NewTask::new("write parser");
        assert_eq!(t.task_type, "code");
        assert!(t.dor_met);
        assert!(t.depends_on.is_empty());

        let t = NewTask::new("gated").pending_readiness(serde_json::json!({"design": "approved"}));
        assert!(!t.dor_met);
    }
}
