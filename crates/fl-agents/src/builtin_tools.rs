//! Tools the execution engine drives: code generation, file access and the
//! build collaborator.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fl_harness::provider::{LlmProvider, Message, Purpose};
use fl_harness::tools::{
    opt_str_arg, str_arg, Result, Tool, ToolCapabilities, ToolDefinition, ToolError, ToolOutput,
    ToolRegistry,
};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::classify::{BuildDiagnostic, BuildReport, Language};

pub const GENERATE_CODE: &str = "generate_code";
pub const WRITE_FILE: &str = "write_file";
pub const EDIT_FILE: &str = "edit_file";
pub const READ_FILE: &str = "read_file";
pub const BUILD: &str = "build";

/// Register the file and build tools plus `generate_code` backed by
/// `provider`.
pub fn register_builtin_tools(registry: &mut ToolRegistry, provider: Arc<dyn LlmProvider>) {
    registry.register(Arc::new(GenerateCodeTool::new(provider)));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(EditFileTool));
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(BuildTool::default()));
}

// ---------------------------------------------------------------------------
// generate_code
// ---------------------------------------------------------------------------

const GENERATE_SYSTEM_PROMPT: &str = "You write complete, compilable source files. \
Reply with the file contents only, no explanation.";

pub struct GenerateCodeTool {
    provider: Arc<dyn LlmProvider>,
}

impl GenerateCodeTool {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for GenerateCodeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            GENERATE_CODE,
            "Generate one source file from a description. The engine writes and builds it.",
            json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string", "description": "What the code must do"},
                    "requirements": {"type": "string"},
                    "language": {"type": "string"},
                    "file_type": {"type": "string", "enum": ["test", "implementation"]},
                    "context": {"type": "string", "description": "Related source to stay consistent with"}
                },
                "required": ["description"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let description = str_arg(&arguments, "description")?;
        let language = opt_str_arg(&arguments, "language")
            .and_then(Language::from_hint)
            .or_else(|| Language::detect(description))
            .unwrap_or_default();

        let mut prompt = format!("Language: {language}\nTask: {description}\n");
        if let Some(req) = opt_str_arg(&arguments, "requirements") {
            prompt.push_str(&format!("Requirements: {req}\n"));
        }
        if let Some(kind) = opt_str_arg(&arguments, "file_type") {
            prompt.push_str(&format!("File type: {kind}\n"));
        }
        if let Some(ctx) = opt_str_arg(&arguments, "context") {
            prompt.push_str(&format!("\nExisting code:\n{ctx}\n"));
        }

        let messages = [Message::system(GENERATE_SYSTEM_PROMPT), Message::user(prompt)];
        let code = self
            .provider
            .generate(Purpose::Code, &messages)
            .await
            .map_err(|e| ToolError::execution(format!("code generation failed: {e}")))?;
        if code.trim().is_empty() {
            return Err(ToolError::execution("code generation returned nothing"));
        }
        Ok(ToolOutput::json(json!({
            "code": code,
            "language": language.as_str(),
        })))
    }
}

// ---------------------------------------------------------------------------
// File tools
// ---------------------------------------------------------------------------

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            WRITE_FILE,
            "Write a file, creating parent directories and replacing existing contents.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let path = Path::new(str_arg(&arguments, "path")?);
        let content = str_arg(&arguments, "content")?;
        let existed = tokio::fs::try_exists(path).await.unwrap_or(false);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::execution(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ToolError::execution(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = content.len(), "file written");
        Ok(ToolOutput::json(json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
            "created": !existed,
        })))
    }
}

/// Replace one exact occurrence of `old_text`. Used for targeted fixes.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            EDIT_FILE,
            "Replace an exact snippet in a file. old_text must occur exactly once.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let path = Path::new(str_arg(&arguments, "path")?);
        let old_text = str_arg(&arguments, "old_text")?;
        let new_text = str_arg(&arguments, "new_text")?;
        if old_text.is_empty() {
            return Err(ToolError::execution("old_text must not be empty"));
        }
        let current = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::execution(format!("read {}: {e}", path.display())))?;
        match current.matches(old_text).count() {
            0 => {
                return Err(ToolError::execution(format!(
                    "old_text not found in {}",
                    path.display()
                )))
            }
            1 => {}
            n => {
                return Err(ToolError::execution(format!(
                    "old_text occurs {n} times in {}; include more context",
                    path.display()
                )))
            }
        }
        let updated = current.replacen(old_text, new_text, 1);
        tokio::fs::write(path, &updated)
            .await
            .map_err(|e| ToolError::execution(format!("write {}: {e}", path.display())))?;
        Ok(ToolOutput::json(json!({
            "path": path.display().to_string(),
            "bytes": updated.len(),
        })))
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            READ_FILE,
            "Read a text file.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        )
        .with_capabilities(ToolCapabilities::read_only())
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let path = str_arg(&arguments, "path")?;
        tokio::fs::read_to_string(path)
            .await
            .map(ToolOutput::text)
            .map_err(|e| ToolError::execution(format!("read {path}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

/// Compiles a project directory with the toolchain its manifest implies and
/// reports the build-result contract.
#[derive(Debug, Clone)]
pub struct BuildTool {
    timeout: Duration,
    command: Option<(String, Vec<String>)>,
}

impl Default for BuildTool {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            command: None,
        }
    }
}

impl BuildTool {
    /// Always run `program args...` instead of detecting the toolchain.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some((program.into(), args));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn detect_command(dir: &Path) -> Option<(String, Vec<String>)> {
        let has = |name: &str| dir.join(name).exists();
        let cmd = |program: &str, args: &[&str]| {
            Some((program.to_string(), args.iter().map(|a| a.to_string()).collect()))
        };
        if has("go.mod") {
            return cmd("go", &["build", "./..."]);
        }
        if has("Cargo.toml") {
            return cmd("cargo", &["build", "--quiet", "--message-format", "short"]);
        }
        if has("package.json") {
            if has("index.ts") {
                return cmd("npx", &["--yes", "tsc", "--noEmit", "index.ts"]);
            }
            return cmd("node", &["--check", "index.js"]);
        }
        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        let mut py = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".py") {
                py.push(name);
            }
        }
        if py.is_empty() {
            return None;
        }
        py.sort();
        let mut args = vec!["-m".to_string(), "py_compile".to_string()];
        args.extend(py);
        Some(("python3".to_string(), args))
    }
}

#[async_trait]
impl Tool for BuildTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            BUILD,
            "Build the project in a directory and report compiler errors.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": "Project directory"}},
                "required": ["path"]
            }),
        )
        .with_capabilities(ToolCapabilities::risky())
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let dir = PathBuf::from(str_arg(&arguments, "path")?);
        if !dir.is_dir() {
            return Err(ToolError::execution(format!("{} is not a directory", dir.display())));
        }
        let (program, args) = match &self.command {
            Some(cmd) => cmd.clone(),
            None => Self::detect_command(&dir).await.ok_or_else(|| {
                ToolError::execution(format!("no buildable project in {}", dir.display()))
            })?,
        };

        info!(dir = %dir.display(), program = %program, "running build");
        let child = Command::new(&program)
            .args(&args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ToolError::execution(format!("build timed out after {:?}", self.timeout)))?
            .map_err(|e| ToolError::execution(format!("failed to run {program}: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let report = report_from_output(output.status.success(), &text);
        debug!(success = report.success, errors = report.error_count, "build finished");
        Ok(ToolOutput::json(json!(report)))
    }
}

/// Assemble the build-result contract from a finished build.
pub fn report_from_output(success: bool, output: &str) -> BuildReport {
    let errors = if success { Vec::new() } else { parse_diagnostics(output) };
    BuildReport {
        success,
        error_count: if success { 0 } else { errors.len().max(1) },
        errors,
        output: output.to_string(),
    }
}

/// Parse `file:line[:column]: message` compiler lines. Warnings are dropped.
pub fn parse_diagnostics(output: &str) -> Vec<BuildDiagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches("./");
            let mut parts = line.splitn(4, ':');
            let file = parts.next()?.trim();
            let line_no: u32 = parts.next()?.trim().parse().ok()?;
            let third = parts.next()?;
            let (column, message) = match third.trim().parse::<u32>() {
                Ok(col) => (col, parts.next().unwrap_or_default().trim()),
                Err(_) => {
                    let rest = parts.next().map(|r| format!("{third}:{r}"));
                    return finish(file, line_no, 0, rest.as_deref().unwrap_or(third).trim());
                }
            };
            finish(file, line_no, column, message)
        })
        .collect()
}

fn finish(file: &str, line: u32, column: u32, message: &str) -> Option<BuildDiagnostic> {
    if file.is_empty() || file.contains(' ') || message.starts_with("warning") {
        return None;
    }
    let error_type = if message.starts_with("error") { "error" } else { "compile" };
    Some(BuildDiagnostic {
        file: file.to_string(),
        line,
        column,
        message: message.to_string(),
        error_type: error_type.to_string(),
    })
}
