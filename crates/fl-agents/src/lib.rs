//! Agent execution: the tool loop, its strategy objects, the feedback
//! channel used for escalation, and the worker pool that feeds it from the
//! task queue.

pub mod builtin_tools;
pub mod classify;
pub mod context;
pub mod engine;
pub mod feedback;
pub mod queue_tools;
pub mod runtime;
pub mod validated;
pub mod worker;

pub use context::{ExecutionError, TaskContext};
pub use engine::{EngineConfig, EngineError, ExecutionResult, FailureKind, ToolExecutionEngine};
pub use feedback::{EscalationRequest, FeedbackChannel, FeedbackError, QueueFeedbackChannel};
pub use runtime::{AgentRuntime, RuntimeError};
pub use worker::{EngineTaskHandler, TaskHandler, WorkerPool, WorkerReport};
