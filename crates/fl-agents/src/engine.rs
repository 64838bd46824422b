//! The tool execution loop.
//!
//! [`ToolExecutionEngine::execute`] takes one model reply and drives tool
//! calls until the task reaches a terminal outcome:
//!
//! ```text
//! reply --parse--> tool call --run--> generate_code? --yes--> write_file -> build
//!   ^                                      | no                               |
//!   |                                  terminal? --yes--> done          ok? --yes--> done
//!   |                                      | no                               | no
//!   +------- next model turn <--- tool result                   simple && retries left?
//!   +------- next model turn <--- fix prompt <----------------------- yes |  no
//!                                                        escalate -> rebuild once
//! ```
//!
//! The loop is bounded by `max_iterations` model turns; simple build fixes
//! are separately bounded by `max_fix_retries`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fl_harness::model_pool::ModelPool;
use fl_harness::provider::{LlmProvider, Message, Purpose};
use fl_harness::tool_call::{parse_tool_call, ToolCall};
use fl_harness::tools::{ToolError, ToolOutput, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::builtin_tools::{BUILD, EDIT_FILE, GENERATE_CODE, WRITE_FILE};
use crate::classify::{
    provision_manifest, BuildReport, BuildSeverity, ErrorAssessment, ErrorClassifier, FileClassifier,
    FileKind, HeuristicErrorClassifier, HeuristicFileClassifier, Language,
};
use crate::context::{ExecutionError, TaskContext};
use crate::feedback::{EscalationRequest, FeedbackChannel};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: usize,
    pub max_fix_retries: usize,
    pub escalation_timeout: Duration,
    /// Model purpose used for follow-up turns.
    pub purpose: Purpose,
    /// Language used when neither the call nor the task names one.
    pub default_language: Language,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 9,
            max_fix_retries: 3,
            escalation_timeout: Duration::from_secs(1800),
            purpose: Purpose::Code,
            default_language: Language::Go,
        }
    }
}

impl From<&fl_core::config::EngineConfig> for EngineConfig {
    fn from(cfg: &fl_core::config::EngineConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations as usize,
            max_fix_retries: cfg.max_fix_retries as usize,
            escalation_timeout: cfg.escalation_timeout(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    ToolExecution,
    Hallucination,
    MaxIterationsExceeded,
    Build,
    Escalation,
    PostFixBuild,
    AttemptsExhausted,
    Provider,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::ToolExecution => "tool_execution",
            FailureKind::Hallucination => "hallucination",
            FailureKind::MaxIterationsExceeded => "max_iterations_exceeded",
            FailureKind::Build => "build",
            FailureKind::Escalation => "escalation",
            FailureKind::PostFixBuild => "post_fix_build",
            FailureKind::AttemptsExhausted => "attempts_exhausted",
            FailureKind::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("model described the work instead of calling a tool")]
    Hallucination,
    #[error("maximum iterations exceeded ({0})")]
    MaxIterationsExceeded(usize),
    #[error("{severity} build failure: {message}")]
    Build { severity: BuildSeverity, message: String },
    #[error("{0}")]
    Escalation(String),
    #[error("post-fix build still failing: {0}")]
    PostFixBuild(String),
    #[error("no valid tool call after {0} attempts")]
    AttemptsExhausted(usize),
    #[error("provider error: {0}")]
    Provider(String),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Validation(_) => FailureKind::Validation,
            EngineError::ToolExecution { .. } => FailureKind::ToolExecution,
            EngineError::Hallucination => FailureKind::Hallucination,
            EngineError::MaxIterationsExceeded(_) => FailureKind::MaxIterationsExceeded,
            EngineError::Build { .. } => FailureKind::Build,
            EngineError::Escalation(_) => FailureKind::Escalation,
            EngineError::PostFixBuild(_) => FailureKind::PostFixBuild,
            EngineError::AttemptsExhausted(_) => FailureKind::AttemptsExhausted,
            EngineError::Provider(_) => FailureKind::Provider,
        }
    }

    fn from_tool(tool: &str, err: ToolError) -> Self {
        match err {
            ToolError::Validation { .. } => EngineError::Validation(err.to_string()),
            other => EngineError::ToolExecution {
                tool: tool.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of one [`execute`](ToolExecutionEngine::execute) run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Final answer, terminal tool output, or the last model reply on failure.
    pub output: String,
    /// Every tool run, in order, including engine-injected ones.
    pub tools_executed: Vec<String>,
    /// Text result (or error) of each entry in `tools_executed`.
    pub tool_results: Vec<String>,
    pub artifacts: Vec<PathBuf>,
    pub hallucination_detected: bool,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub last_tool: Option<String>,
    pub iterations: usize,
}

impl ExecutionResult {
    /// Failed result for errors raised before the loop starts.
    pub fn failed(error: &EngineError) -> Self {
        Self {
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            hallucination_detected: matches!(error, EngineError::Hallucination),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ToolExecutionEngine {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    feedback: Arc<dyn FeedbackChannel>,
    config: EngineConfig,
    file_classifier: Arc<dyn FileClassifier>,
    error_classifier: Arc<dyn ErrorClassifier>,
    models: Option<ModelPool>,
}

/// Mutable state of one run.
#[derive(Default)]
struct Run {
    tools_executed: Vec<String>,
    tool_results: Vec<String>,
    iterations: usize,
    fix_retries: usize,
    /// Project directory awaiting a rebuild after a model-issued fix.
    pending_fix: Option<PathBuf>,
    last_response: String,
}

/// What the loop does after a build-related step.
enum Flow {
    Complete(String),
    Reprompt(String),
}

impl ToolExecutionEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        feedback: Arc<dyn FeedbackChannel>,
    ) -> Self {
        Self {
            provider,
            tools,
            feedback,
            config: EngineConfig::default(),
            file_classifier: Arc::new(HeuristicFileClassifier),
            error_classifier: Arc::new(HeuristicErrorClassifier::default()),
            models: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_file_classifier(mut self, classifier: Arc<dyn FileClassifier>) -> Self {
        self.file_classifier = classifier;
        self
    }

    pub fn with_error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.error_classifier = classifier;
        self
    }

    /// Hold a lease on the configured purpose for the duration of each run.
    pub fn with_model_pool(mut self, pool: ModelPool) -> Self {
        self.models = Some(pool);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn model_pool(&self) -> Option<&ModelPool> {
        self.models.as_ref()
    }

    /// Drive `response` to a terminal outcome.
    pub async fn execute(
        &self,
        response: String,
        system_prompt: &str,
        user_prompt: &str,
        ctx: &mut TaskContext,
    ) -> ExecutionResult {
        let mut run = Run {
            last_response: response,
            ..Run::default()
        };

        let lease = match &self.models {
            Some(pool) => match pool.acquire(self.config.purpose).await {
                Ok(lease) => Some(lease),
                Err(e) => return self.fail(run, ctx, EngineError::Provider(e.to_string())),
            },
            None => None,
        };

        let result = self.drive(&mut run, system_prompt, user_prompt, ctx).await;
        if let Some(lease) = lease {
            lease.release().await;
        }
        match result {
            Ok(output) => self.succeed(run, ctx, output),
            Err(e) => self.fail(run, ctx, e),
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        system_prompt: &str,
        user_prompt: &str,
        ctx: &mut TaskContext,
    ) -> Result<String, EngineError> {
        let mut messages = vec![Message::system(system_prompt), Message::user(user_prompt)];
        let max = self.config.max_iterations.max(1);

        for iteration in 1..=max {
            run.iterations = iteration;
            messages.push(Message::assistant(run.last_response.clone()));

            let Some(mut call) = parse_tool_call(&run.last_response) else {
                if run.tools_executed.is_empty() {
                    return Err(EngineError::Hallucination);
                }
                let Some(dir) = run.pending_fix.clone() else {
                    debug!(task_key = %ctx.task_key(), iteration, "final answer");
                    return Ok(run.last_response.clone());
                };
                // A prose answer does not clear a failing build.
                warn!(task_key = %ctx.task_key(), iteration, "final answer with a fix pending, rebuilding");
                match self.build_and_handle(run, ctx, &dir).await? {
                    Flow::Complete(summary) => return Ok(summary),
                    Flow::Reprompt(prompt) => messages.push(Message::user(prompt)),
                }
                if iteration == max {
                    break;
                }
                run.last_response = self.next_reply(&messages).await?;
                continue;
            };
            debug!(task_key = %ctx.task_key(), iteration, tool = %call.tool, "tool call");

            if call.tool == GENERATE_CODE {
                self.inline_dependency_sources(&mut call, ctx).await;
            }
            let output = self.run_tool(run, &call.tool, call.arguments.clone()).await?;

            let flow = match call.tool.as_str() {
                GENERATE_CODE => Some(self.after_generate(run, ctx, &call, &output, user_prompt).await?),
                WRITE_FILE | EDIT_FILE => {
                    if let Some(path) = call.arguments.get("path").and_then(Value::as_str) {
                        track_write(ctx, &call.tool, path, &output);
                    }
                    match run.pending_fix.clone() {
                        Some(dir) => Some(self.build_and_handle(run, ctx, &dir).await?),
                        None => None,
                    }
                }
                BUILD => {
                    let dir = call
                        .arguments
                        .get("path")
                        .and_then(Value::as_str)
                        .map(PathBuf::from)
                        .unwrap_or_default();
                    let report = BuildReport::from_tool_output(output.structured.as_ref(), &output.content);
                    Some(self.handle_build(run, ctx, &dir, report).await?)
                }
                _ => None,
            };

            match flow {
                Some(Flow::Complete(summary)) => return Ok(summary),
                Some(Flow::Reprompt(prompt)) => messages.push(Message::user(prompt)),
                None => {
                    if self.tools.is_terminal(&call.tool) {
                        info!(task_key = %ctx.task_key(), tool = %call.tool, "terminal tool finished the task");
                        return Ok(output.content);
                    }
                    messages.push(Message::user(format!(
                        "Tool {} result:\n{}",
                        call.tool, output.content
                    )));
                }
            }

            if iteration == max {
                break;
            }
            run.last_response = self.next_reply(&messages).await?;
        }

        warn!(task_key = %ctx.task_key(), max, "iteration cap reached");
        Err(EngineError::MaxIterationsExceeded(max))
    }

    async fn next_reply(&self, messages: &[Message]) -> Result<String, EngineError> {
        self.provider
            .generate(self.config.purpose, messages)
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))
    }

    async fn run_tool(&self, run: &mut Run, name: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let result = self.tools.execute(name, arguments).await;
        run.tools_executed.push(name.to_string());
        match result {
            Ok(output) => {
                run.tool_results.push(output.content.clone());
                Ok(output)
            }
            Err(e) => {
                run.tool_results.push(e.to_string());
                Err(EngineError::from_tool(name, e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // generate_code pipeline
    // -----------------------------------------------------------------------

    fn file_kind(&self, arguments: &Value) -> FileKind {
        let field = |k: &str| arguments.get(k).and_then(Value::as_str).unwrap_or_default();
        let explicit = arguments.get("file_type").and_then(Value::as_str);
        self.file_classifier
            .classify(field("description"), field("requirements"), explicit)
    }

    /// Test generation sees the implementation it tests: non-test
    /// dependency files are appended to the call's `context` argument.
    async fn inline_dependency_sources(&self, call: &mut ToolCall, ctx: &TaskContext) {
        if self.file_kind(&call.arguments) != FileKind::Test {
            return;
        }
        let sources: Vec<&PathBuf> = ctx
            .dependency_files()
            .iter()
            .filter(|p| !self.file_classifier.is_test_path(p))
            .collect();
        if sources.is_empty() {
            return;
        }
        let Some(args) = call.arguments.as_object_mut() else {
            return;
        };

        let mut context = args
            .get("context")
            .and_then(Value::as_str)
            .map(|c| format!("{c}\n\n"))
            .unwrap_or_default();
        let mut inlined = 0;
        for path in sources {
            match tokio::fs::read_to_string(path).await {
                Ok(text) => {
                    context.push_str(&format!("// File: {}\n{}\n", path.display(), text));
                    inlined += 1;
                }
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable dependency file"),
            }
        }
        if inlined > 0 {
            debug!(task_key = %ctx.task_key(), files = inlined, "inlined dependency sources");
            args.insert("context".into(), Value::String(context));
        }
    }

    async fn after_generate(
        &self,
        run: &mut Run,
        ctx: &mut TaskContext,
        call: &ToolCall,
        output: &ToolOutput,
        user_prompt: &str,
    ) -> Result<Flow, EngineError> {
        let structured = output.structured.as_ref();
        let code = structured
            .and_then(|s| s.get("code"))
            .and_then(Value::as_str)
            .unwrap_or(&output.content);
        let code = strip_code_fences(code);

        let language = call
            .arguments
            .get("language")
            .and_then(Value::as_str)
            .and_then(Language::from_hint)
            .or_else(|| {
                structured
                    .and_then(|s| s.get("language"))
                    .and_then(Value::as_str)
                    .and_then(Language::from_hint)
            })
            .or_else(|| {
                call.arguments
                    .get("description")
                    .and_then(Value::as_str)
                    .and_then(Language::detect)
            })
            .or_else(|| Language::detect(ctx.description()))
            .unwrap_or(self.config.default_language);
        let kind = self.file_kind(&call.arguments);

        let dir = project_dir(ctx, user_prompt).ok_or_else(|| {
            EngineError::Validation("no project path in task context or prompt".into())
        })?;
        let file = dir.join(language.file_name(kind));
        info!(task_key = %ctx.task_key(), file = %file.display(), %language, ?kind, "writing generated code");

        let written = self
            .run_tool(run, WRITE_FILE, json!({"path": file.display().to_string(), "content": code}))
            .await?;
        track_write(ctx, WRITE_FILE, &file.display().to_string(), &written);

        match provision_manifest(&dir, language).await {
            Ok(Some(manifest)) => ctx.add_created_file(manifest),
            Ok(None) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "could not provision build manifest"),
        }

        self.build_and_handle(run, ctx, &dir).await
    }

    // -----------------------------------------------------------------------
    // Build handling
    // -----------------------------------------------------------------------

    async fn build_and_handle(&self, run: &mut Run, ctx: &mut TaskContext, dir: &Path) -> Result<Flow, EngineError> {
        let report = self.build(run, dir).await?;
        self.handle_build(run, ctx, dir, report).await
    }

    async fn build(&self, run: &mut Run, dir: &Path) -> Result<BuildReport, EngineError> {
        let output = self
            .run_tool(run, BUILD, json!({"path": dir.display().to_string()}))
            .await?;
        Ok(BuildReport::from_tool_output(output.structured.as_ref(), &output.content))
    }

    async fn handle_build(
        &self,
        run: &mut Run,
        ctx: &mut TaskContext,
        dir: &Path,
        report: BuildReport,
    ) -> Result<Flow, EngineError> {
        if report.success {
            run.pending_fix = None;
            info!(task_key = %ctx.task_key(), dir = %dir.display(), "build succeeded");
            return Ok(Flow::Complete(format!("Build succeeded in {}", dir.display())));
        }

        let assessment = self.error_classifier.classify(&report);
        let error_text = report.error_text();
        let mut recorded = ExecutionError::new(
            ctx.attempt(),
            Some(BUILD),
            format!("build_{}", assessment.severity),
            &error_text,
        );
        if let Some(first) = report.errors.first() {
            recorded = recorded.at(&first.file, (first.line > 0).then_some(first.line));
        }
        ctx.add_error(recorded);
        warn!(
            task_key = %ctx.task_key(),
            severity = %assessment.severity,
            errors = assessment.error_count,
            files = assessment.affected_files,
            fix_retries = run.fix_retries,
            "build failed"
        );

        if assessment.severity == BuildSeverity::Simple && run.fix_retries < self.config.max_fix_retries {
            run.fix_retries += 1;
            run.pending_fix = Some(dir.to_path_buf());
            let prompt = self.fix_prompt(ctx, dir, &report, &error_text, run.fix_retries).await;
            return Ok(Flow::Reprompt(prompt));
        }

        self.escalate(run, ctx, dir, &report, &assessment, error_text).await
    }

    fn offending_file(&self, ctx: &TaskContext, dir: &Path, report: &BuildReport) -> Option<PathBuf> {
        report
            .errors
            .iter()
            .find(|e| !e.file.is_empty())
            .map(|e| {
                let p = Path::new(&e.file);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    dir.join(p)
                }
            })
            .or_else(|| ctx.created_files().iter().rev().find(|p| p.starts_with(dir)).cloned())
    }

    async fn fix_prompt(
        &self,
        ctx: &TaskContext,
        dir: &Path,
        report: &BuildReport,
        error_text: &str,
        attempt: usize,
    ) -> String {
        let mut prompt = format!(
            "The build failed (fix attempt {attempt} of {}).\n\nErrors:\n{error_text}\n",
            self.config.max_fix_retries
        );
        if let Some(path) = self.offending_file(ctx, dir, report) {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => prompt.push_str(&format!(
                    "\nCurrent content of {}:\n```\n{}\n```\n",
                    path.display(),
                    content.trim_end()
                )),
                Err(e) => debug!(path = %path.display(), error = %e, "offending file unreadable"),
            }
        }
        prompt.push_str(
            "\nFix only the reported lines with an edit_file call \
             (path, old_text, new_text). Do not rewrite the whole file.",
        );
        prompt
    }

    async fn escalate(
        &self,
        run: &mut Run,
        ctx: &mut TaskContext,
        dir: &Path,
        report: &BuildReport,
        assessment: &ErrorAssessment,
        error_text: String,
    ) -> Result<Flow, EngineError> {
        let target_file = self
            .offending_file(ctx, dir, report)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let request = EscalationRequest {
            dependency_description: format!(
                "Resolve the build failure blocking {}: {}",
                ctx.task_key(),
                ctx.description()
            ),
            dependency_type: "build_fix".into(),
            error_message: error_text,
            error_type: assessment.error_type.clone(),
            severity: assessment.severity,
            affected_files: assessment.affected_files,
            error_count: assessment.error_count,
            target_path: dir.display().to_string(),
            target_file,
            suggestion: assessment.suggestion.clone(),
        };
        warn!(
            task_key = %ctx.task_key(),
            severity = %assessment.severity,
            fix_retries = run.fix_retries,
            "escalating build failure"
        );

        let origin = (ctx.task_id() != 0).then(|| ctx.task_key().to_string());
        let outcome = self
            .feedback
            .send_and_wait(origin.as_deref(), request, self.config.escalation_timeout)
            .await
            .map_err(|e| {
                EngineError::Escalation(format!(
                    "{} build failure could not be escalated: {e}",
                    assessment.severity
                ))
            })?;
        info!(task_key = %ctx.task_key(), fix_task = %outcome.fix_task, "fix landed, rebuilding");

        run.pending_fix = None;
        let report = self.build(run, dir).await?;
        if report.success {
            Ok(Flow::Complete(format!(
                "Build succeeded in {} after fix {}",
                dir.display(),
                outcome.fix_task
            )))
        } else {
            Err(EngineError::PostFixBuild(report.error_text()))
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    fn succeed(&self, run: Run, ctx: &mut TaskContext, output: String) -> ExecutionResult {
        ctx.mark_finished();
        info!(
            task_key = %ctx.task_key(),
            tools = ?run.tools_executed,
            iterations = run.iterations,
            "execution succeeded"
        );
        ExecutionResult {
            success: true,
            output,
            last_tool: run.tools_executed.last().cloned(),
            tools_executed: run.tools_executed,
            tool_results: run.tool_results,
            artifacts: artifacts(ctx),
            hallucination_detected: false,
            error: None,
            failure: None,
            iterations: run.iterations,
        }
    }

    fn fail(&self, run: Run, ctx: &mut TaskContext, error: EngineError) -> ExecutionResult {
        let last_tool = run.tools_executed.last().cloned();
        ctx.add_error(ExecutionError::new(
            ctx.attempt(),
            last_tool.as_deref(),
            error.kind().as_str(),
            error.to_string(),
        ));
        ctx.mark_finished();
        warn!(
            task_key = %ctx.task_key(),
            failure = error.kind().as_str(),
            error = %error,
            iterations = run.iterations,
            "execution failed"
        );
        ExecutionResult {
            success: false,
            output: run.last_response,
            tools_executed: run.tools_executed,
            tool_results: run.tool_results,
            artifacts: artifacts(ctx),
            hallucination_detected: matches!(error, EngineError::Hallucination),
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            last_tool,
            iterations: run.iterations,
        }
    }
}

fn artifacts(ctx: &TaskContext) -> Vec<PathBuf> {
    ctx.created_files()
        .iter()
        .chain(ctx.modified_files())
        .cloned()
        .collect()
}

fn track_write(ctx: &mut TaskContext, tool: &str, path: &str, output: &ToolOutput) {
    let created = tool == WRITE_FILE
        && output
            .structured
            .as_ref()
            .and_then(|s| s.get("created"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
    if created {
        ctx.add_created_file(path);
    } else {
        ctx.add_modified_file(path);
    }
}

/// Project directory from the context, else a `Project path:` line in the
/// prompt.
fn project_dir(ctx: &TaskContext, prompt: &str) -> Option<PathBuf> {
    if let Some(path) = ctx.project_path() {
        return Some(path.to_path_buf());
    }
    prompt.lines().find_map(|line| {
        let line = line.trim();
        let (label, rest) = line.split_once(':')?;
        label
            .trim()
            .eq_ignore_ascii_case("project path")
            .then(|| rest.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    })
}

/// Body of the first fenced block, or the text itself when unfenced.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return format!("{trimmed}\n");
    };
    let after = &trimmed[start + 3..];
    let body_start = after.find('\n').map_or(after.len(), |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    format!("{}\n", body[..end].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```go\npackage main\n```"), "package main\n");
        assert_eq!(strip_code_fences("Here:\n```\nx = 1\n```\nthanks"), "x = 1\n");
        assert_eq!(strip_code_fences("print('hi')"), "print('hi')\n");
    }

    #[test]
    fn project_dir_falls_back_to_prompt() {
        let ctx = TaskContext::new("TASK-001", "hello");
        let dir = project_dir(&ctx, "Write hello\nProject path: /tmp/hello\n");
        assert_eq!(dir, Some(PathBuf::from("/tmp/hello")));
        assert_eq!(project_dir(&ctx, "no path here"), None);

        let ctx = ctx.with_project_path("/srv/p");
        assert_eq!(project_dir(&ctx, "Project path: /tmp/x"), Some(PathBuf::from("/srv/p")));
    }

    #[test]
    fn failure_kinds_serialize_snake_case() {
        let v = serde_json::to_value(FailureKind::PostFixBuild).unwrap();
        assert_eq!(v, "post_fix_build");
        assert_eq!(EngineError::MaxIterationsExceeded(9).kind().as_str(), "max_iterations_exceeded");
    }
}
