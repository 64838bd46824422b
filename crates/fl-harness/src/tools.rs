//! Typed tool registry.
//!
//! Each tool is a [`Tool`] implementation with a JSON-schema definition and
//! explicit capability metadata. The registry validates arguments against
//! the schema before dispatch and consults a [`Confirmer`] for tools marked
//! risky. The model-facing wire contract stays
//! `{"tool": "<name>", "arguments": {...}}`.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Arguments rejected before execution.
    #[error("invalid arguments for {tool}: {message}")]
    Validation { tool: String, message: String },
    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),
    #[error("execution of {0} was not confirmed")]
    Denied(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Behavioural hints the engine and registry act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    /// The tool fully owns task completion; the loop returns its output
    /// without asking the model for a next step.
    #[serde(default)]
    pub terminal: bool,
    /// Requires confirmation before running.
    #[serde(default)]
    pub risky: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl ToolCapabilities {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn risky() -> Self {
        Self {
            risky: true,
            ..Default::default()
        }
    }

    pub fn terminal() -> Self {
        Self {
            terminal: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default)]
    pub capabilities: ToolCapabilities,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            capabilities: ToolCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ToolCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Result of a successful tool run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text fed back to the model.
    pub content: String,
    /// Machine-readable payload (e.g. a build result), when the tool has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            structured: None,
        }
    }

    /// Structured output whose text form is the pretty-printed JSON.
    pub fn json(value: Value) -> Self {
        Self {
            content: serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
            structured: Some(value),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, arguments: Value) -> Result<ToolOutput>;
}

// ---------------------------------------------------------------------------
// Confirmation policy
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, tool: &str, arguments: &Value) -> bool;
}

/// Approves everything. Required for background workers, which must never
/// block on a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _tool: &str, _arguments: &Value) -> bool {
        true
    }
}

/// Refuses every risky tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyRisky;

#[async_trait]
impl Confirmer for DenyRisky {
    async fn confirm(&self, tool: &str, _arguments: &Value) -> bool {
        debug!(tool, "risky tool denied by policy");
        false
    }
}

/// Asks on stderr and reads `y`/`yes` from stdin on a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, tool: &str, arguments: &Value) -> bool {
        let prompt = format!("Run {tool} with {arguments}? [y/N] ");
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(prompt.as_bytes());
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-indexed set of tools plus the confirmation policy.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    confirmer: Arc<dyn Confirmer>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            confirmer: Arc::new(AutoConfirm),
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "replaced existing tool registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn capabilities(&self, name: &str) -> Option<ToolCapabilities> {
        self.tools.get(name).map(|t| t.definition().capabilities)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.capabilities(name).is_some_and(|c| c.terminal)
    }

    /// One line per tool, for system prompts.
    pub fn catalog(&self) -> String {
        self.definitions()
            .iter()
            .map(|d| format!("- {}: {} (arguments: {})", d.name, d.description, d.input_schema))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Validate and run a tool.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let def = tool.definition();

        validate_arguments(&def.input_schema, &arguments).map_err(|message| {
            ToolError::Validation {
                tool: name.to_string(),
                message,
            }
        })?;

        if def.capabilities.risky && !self.confirmer.confirm(name, &arguments).await {
            warn!(tool = %name, "risky tool not confirmed");
            return Err(ToolError::Denied(name.to_string()));
        }

        let result = tool.call(arguments).await;
        match &result {
            Ok(out) => info!(tool = %name, bytes = out.content.len(), "executed tool"),
            Err(e) => warn!(tool = %name, error = %e, "tool failed"),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Argument validation
// ---------------------------------------------------------------------------

/// Check `args` against the subset of JSON Schema tools use: an object
/// with `required` keys and per-property `type` / `enum`.
pub fn validate_arguments(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match obj.get(key) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required parameter: {key}"));
                }
                Some(_) => {}
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        let Some(prop) = props.get(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if let Some(ty) = prop.get("type").and_then(Value::as_str) {
            if !type_matches(ty, value) {
                return Err(format!("parameter {key} must be of type {ty}"));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("parameter {key} must be one of {}", Value::from(allowed.clone())));
            }
        }
    }
    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Argument helpers for tool implementations
// ---------------------------------------------------------------------------

/// Required string argument.
pub fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::execution(format!("missing required parameter: {key}")))
}

pub fn opt_str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
