use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fl_agents::builtin_tools::{EditFileTool, WriteFileTool};
use fl_agents::classify::BuildSeverity;
use fl_agents::engine::{EngineConfig, FailureKind, ToolExecutionEngine};
use fl_agents::feedback::{EscalationOutcome, EscalationRequest, FeedbackChannel, FeedbackError};
use fl_agents::TaskContext;
use fl_core::types::{FeedbackMessage, TaskStatus};
use fl_harness::provider::{Role, ScriptedProvider};
use fl_harness::tools::{Tool, ToolCapabilities, ToolDefinition, ToolError, ToolOutput, ToolRegistry};
use serde_json::{json, Value};

const GENERATED: &str = "```go\npackage main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"hi\")\n}\n```";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeGenerate {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl Tool for FakeGenerate {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "generate_code",
            "fake generator",
            json!({
                "type": "object",
                "properties": {"description": {"type": "string"}},
                "required": ["description"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.seen.lock().unwrap().push(arguments);
        Ok(ToolOutput::json(json!({"code": GENERATED, "language": "go"})))
    }
}

/// Replays build-result payloads in order.
struct FakeBuild {
    results: Mutex<VecDeque<Value>>,
    calls: Mutex<usize>,
}

impl FakeBuild {
    fn new(results: Vec<Value>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Tool for FakeBuild {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "build",
            "fake build",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        )
    }

    async fn call(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        *self.calls.lock().unwrap() += 1;
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .map(ToolOutput::json)
            .ok_or_else(|| ToolError::execution("no scripted build result"))
    }
}

struct Echo {
    terminal: bool,
    name: &'static str,
}

#[async_trait]
impl Tool for Echo {
    fn definition(&self) -> ToolDefinition {
        let def = ToolDefinition::new(self.name, "echo", json!({"type": "object"}));
        if self.terminal {
            def.with_capabilities(ToolCapabilities::terminal())
        } else {
            def
        }
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(format!("{} says {}", self.name, arguments)))
    }
}

struct Explode;

#[async_trait]
impl Tool for Explode {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("explode", "always fails", json!({"type": "object"}))
    }

    async fn call(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::execution("boom"))
    }
}

#[derive(Default)]
struct FakeFeedback {
    fail: bool,
    requests: Mutex<Vec<EscalationRequest>>,
}

#[async_trait]
impl FeedbackChannel for FakeFeedback {
    async fn send(&self, _message: FeedbackMessage) -> Result<(), FeedbackError> {
        Ok(())
    }

    async fn send_and_wait(
        &self,
        _origin: Option<&str>,
        request: EscalationRequest,
        _timeout: Duration,
    ) -> Result<EscalationOutcome, FeedbackError> {
        self.requests.lock().unwrap().push(request);
        if self.fail {
            Err(FeedbackError::FixFailed {
                task_key: "TASK-900".into(),
                status: TaskStatus::Rejected,
            })
        } else {
            Ok(EscalationOutcome {
                fix_task: "TASK-900".into(),
                waited: Duration::ZERO,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    engine: ToolExecutionEngine,
    provider: Arc<ScriptedProvider>,
    generate: Arc<FakeGenerate>,
    build: Arc<FakeBuild>,
    feedback: Arc<FakeFeedback>,
}

fn harness(replies: Vec<String>, builds: Vec<Value>, feedback: FakeFeedback) -> Harness {
    let provider = Arc::new(ScriptedProvider::new(replies));
    let generate = Arc::new(FakeGenerate::default());
    let build = Arc::new(FakeBuild::new(builds));
    let feedback = Arc::new(feedback);

    let mut registry = ToolRegistry::new();
    registry.register(generate.clone());
    registry.register(build.clone());
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(EditFileTool));
    registry.register(Arc::new(Echo { terminal: false, name: "echo" }));
    registry.register(Arc::new(Echo { terminal: true, name: "delegate" }));
    registry.register(Arc::new(Explode));

    let engine = ToolExecutionEngine::new(provider.clone(), Arc::new(registry), feedback.clone());
    Harness {
        engine,
        provider,
        generate,
        build,
        feedback,
    }
}

fn ok_build() -> Value {
    json!({"success": true, "error_count": 0, "errors": [], "output": "ok"})
}

fn simple_failure() -> Value {
    json!({
        "success": false,
        "error_count": 1,
        "errors": [{"file": "main.go", "line": 6, "column": 2, "message": "undefined: fmt.Printn", "type": "compile"}],
        "output": "./main.go:6:2: undefined: fmt.Printn"
    })
}

fn complex_failure() -> Value {
    json!({
        "success": false,
        "error_count": 2,
        "errors": [
            {"file": "main.go", "line": 3, "column": 8, "message": "imported and not used", "type": "compile"},
            {"file": "util.go", "line": 9, "column": 1, "message": "missing return", "type": "compile"}
        ],
        "output": ""
    })
}

fn generate_call(description: &str) -> String {
    json!({"tool": "generate_code", "arguments": {"description": description}}).to_string()
}

fn edit_call(path: &Path) -> String {
    json!({
        "tool": "edit_file",
        "arguments": {
            "path": path.display().to_string(),
            "old_text": "func main() {",
            "new_text": "func main() {"
        }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generate_write_build_succeeds_without_extra_model_turns() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![], vec![ok_build()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello world").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.tools_executed, vec!["generate_code", "write_file", "build"]);
    assert_eq!(result.tool_results.len(), 3);
    assert_eq!(h.provider.call_count(), 0);

    let main = dir.path().join("main.go");
    let written = std::fs::read_to_string(&main).unwrap();
    assert!(written.starts_with("package main"));
    assert!(!written.contains("```"));
    assert!(dir.path().join("go.mod").exists());
    assert!(result.artifacts.contains(&main));
    assert!(ctx.finished_at().is_some());
}

#[tokio::test]
async fn prose_without_any_tool_is_hallucination() {
    let h = harness(vec![], vec![], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello");

    let result = h
        .engine
        .execute("I would write a Go program that prints hello.".into(), "sys", "user", &mut ctx)
        .await;

    assert!(!result.success);
    assert!(result.hallucination_detected);
    assert_eq!(result.failure, Some(FailureKind::Hallucination));
    assert!(result.tools_executed.is_empty());
    assert_eq!(ctx.errors().len(), 1);
}

#[tokio::test]
async fn three_simple_failures_reprompt_then_fourth_escalates() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.go");
    let replies = vec![edit_call(&main), edit_call(&main), edit_call(&main)];
    let builds = vec![
        simple_failure(),
        simple_failure(),
        simple_failure(),
        simple_failure(),
        ok_build(),
    ];
    let h = harness(replies, builds, FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(h.provider.call_count(), 3);
    assert_eq!(h.build.calls(), 5);
    assert_eq!(h.feedback.requests.lock().unwrap().len(), 1);
    assert_eq!(
        result.tools_executed,
        vec![
            "generate_code", "write_file", "build",
            "edit_file", "build",
            "edit_file", "build",
            "edit_file", "build",
            "build",
        ]
    );
    assert_eq!(ctx.errors().len(), 4);

    let first_prompt = h.provider.calls()[0].last().cloned().unwrap();
    assert_eq!(first_prompt.role, Role::User);
    assert!(first_prompt.content.contains("fix attempt 1 of 3"));
    assert!(first_prompt.content.contains("undefined: fmt.Printn"));
    assert!(first_prompt.content.contains("func main()"));
    assert!(first_prompt.content.contains("edit_file"));
}

#[tokio::test]
async fn complex_failure_escalates_and_reports_post_fix_failure() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![], vec![complex_failure(), complex_failure()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::PostFixBuild));
    assert!(result.error.as_deref().unwrap().contains("post-fix"));
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(h.build.calls(), 2);

    let requests = h.feedback.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].severity, BuildSeverity::Complex);
    assert_eq!(requests[0].affected_files, 2);
    assert_eq!(requests[0].error_count, 2);
    assert_eq!(requests[0].target_path, dir.path().display().to_string());
    assert!(requests[0].target_file.ends_with("main.go"));
}

#[tokio::test]
async fn complex_failure_recovers_after_fix() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![], vec![complex_failure(), ok_build()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(result.success);
    assert!(result.output.contains("TASK-900"));
    assert_eq!(result.tools_executed, vec!["generate_code", "write_file", "build", "build"]);
}

#[tokio::test]
async fn failed_escalation_aborts_without_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let feedback = FakeFeedback {
        fail: true,
        ..Default::default()
    };
    let h = harness(vec![], vec![complex_failure()], feedback);
    let mut ctx = TaskContext::new("TASK-001", "hello").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Escalation));
    assert!(result.error.as_deref().unwrap().contains("TASK-900"));
    assert_eq!(h.build.calls(), 1);
}

#[tokio::test]
async fn terminal_tool_ends_the_loop() {
    let h = harness(vec![], vec![], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "delegate");
    let response = json!({"tool": "delegate", "arguments": {"goal": "x"}}).to_string();

    let result = h.engine.execute(response, "sys", "user", &mut ctx).await;

    assert!(result.success);
    assert!(result.output.starts_with("delegate says"));
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn prose_after_a_tool_is_the_final_answer() {
    let h = harness(vec!["All done.".into()], vec![], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "echo");
    let response = json!({"tool": "echo", "arguments": {"text": "hi"}}).to_string();

    let result = h.engine.execute(response, "sys", "user", &mut ctx).await;

    assert!(result.success);
    assert_eq!(result.output, "All done.");
    assert_eq!(result.tools_executed, vec!["echo"]);
    assert_eq!(result.iterations, 2);

    let sent = &h.provider.calls()[0];
    assert_eq!(sent[0].role, Role::System);
    assert!(sent.last().unwrap().content.starts_with("Tool echo result:\n"));
}

#[tokio::test]
async fn prose_during_a_pending_fix_triggers_a_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let replies = vec!["I have fixed the typo.".to_string(), "Still fine, trust me.".to_string()];
    let h = harness(replies, vec![simple_failure(), simple_failure(), ok_build()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello").with_project_path(dir.path());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", "user", &mut ctx)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.output.starts_with("Build succeeded"), "{}", result.output);
    assert_eq!(h.build.calls(), 3);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(
        result.tools_executed,
        vec!["generate_code", "write_file", "build", "build", "build"]
    );
    assert!(h.feedback.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn iteration_cap_fails_with_last_response() {
    let call = json!({"tool": "echo", "arguments": {"n": 1}}).to_string();
    let h = harness(vec![call.clone(); 10], vec![], FakeFeedback::default());
    let engine = h.engine.with_config(EngineConfig {
        max_iterations: 3,
        ..EngineConfig::default()
    });
    let mut ctx = TaskContext::new("TASK-001", "loop");

    let result = engine.execute(call.clone(), "sys", "user", &mut ctx).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::MaxIterationsExceeded));
    assert_eq!(result.iterations, 3);
    assert_eq!(result.output, call);
    assert_eq!(result.error.as_deref(), Some("maximum iterations exceeded (3)"));
    assert_eq!(h.provider.call_count(), 2);
}

#[tokio::test]
async fn tool_failure_aborts_immediately() {
    let h = harness(vec!["unused".into()], vec![], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "boom");
    let response = json!({"tool": "explode", "arguments": {}}).to_string();

    let result = h.engine.execute(response, "sys", "user", &mut ctx).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::ToolExecution));
    assert!(result.error.as_deref().unwrap().contains("boom"));
    assert_eq!(result.last_tool.as_deref(), Some("explode"));
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(ctx.last_error().unwrap().tool.as_deref(), Some("explode"));
}

#[tokio::test]
async fn invalid_arguments_are_a_validation_failure() {
    let h = harness(vec![], vec![], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello");
    let response = json!({"tool": "generate_code", "arguments": {"language": "go"}}).to_string();

    let result = h.engine.execute(response, "sys", "user", &mut ctx).await;

    assert_eq!(result.failure, Some(FailureKind::Validation));
    assert!(h.generate.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_generation_sees_dependency_sources() {
    let dir = tempfile::tempdir().unwrap();
    let impl_file = dir.path().join("main.go");
    let test_file = dir.path().join("main_test.go");
    std::fs::write(&impl_file, "package main\n\nfunc Add(a, b int) int { return a + b }\n").unwrap();
    std::fs::write(&test_file, "package main // old tests\n").unwrap();

    let h = harness(vec![], vec![ok_build()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-002", "tests for Add")
        .with_project_path(dir.path())
        .with_dependencies(vec!["TASK-001".into()], vec![impl_file.clone(), test_file.clone()]);

    let result = h
        .engine
        .execute(generate_call("Write unit tests for Add in Go"), "sys", "user", &mut ctx)
        .await;
    assert!(result.success);

    let seen = h.generate.seen.lock().unwrap();
    let context = seen[0]["context"].as_str().unwrap();
    assert!(context.contains("func Add(a, b int)"));
    assert!(!context.contains("old tests"));
    assert!(dir.path().join("main_test.go").exists());
    assert!(result.artifacts.iter().all(|p| p != &impl_file));
}

#[tokio::test]
async fn project_path_can_come_from_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(vec![], vec![ok_build()], FakeFeedback::default());
    let mut ctx = TaskContext::new("TASK-001", "hello");
    let prompt = format!("Build hello world\nProject path: {}\n", dir.path().display());

    let result = h
        .engine
        .execute(generate_call("hello world in Go"), "sys", &prompt, &mut ctx)
        .await;

    assert!(result.success);
    assert!(dir.path().join("main.go").exists());
}
