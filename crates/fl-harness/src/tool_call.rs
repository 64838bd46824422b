//! Tool-call wire format: `{"tool": "<name>", "arguments": { ... }}`.
//!
//! Models often wrap the call in prose or a fenced block, so the parser
//! falls back to a brace-balanced scan that understands JSON string
//! escapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }

    /// Wire form of the call.
    pub fn to_json(&self) -> String {
        serde_json::json!({ "tool": self.tool, "arguments": self.arguments }).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallParseError {
    #[error("no JSON object found in response")]
    NoJson,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("missing or empty \"tool\" field")]
    MissingTool,
    #[error("missing or null \"arguments\" field")]
    MissingArguments,
}

/// Interpret a model response as a tool call, or `None` if it is not one.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    parse_tool_call_strict(text).ok()
}

/// Like [`parse_tool_call`] but reports why a response was rejected, for
/// correction prompts.
pub fn parse_tool_call_strict(text: &str) -> Result<ToolCall, ToolCallParseError> {
    let trimmed = text.trim();

    // Whole response is JSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return validate(value);
        }
    }

    let Some(start) = find_tool_object(trimmed) else {
        return match trimmed.find('{') {
            Some(pos) => match extract_balanced(trimmed, pos) {
                Some(obj) => match serde_json::from_str::<Value>(obj) {
                    Ok(value) => validate(value),
                    Err(e) => Err(ToolCallParseError::Malformed(e.to_string())),
                },
                None => Err(ToolCallParseError::Malformed("unbalanced braces".into())),
            },
            None => Err(ToolCallParseError::NoJson),
        };
    };
    let obj = extract_balanced(trimmed, start)
        .ok_or_else(|| ToolCallParseError::Malformed("unbalanced braces".into()))?;
    let value: Value =
        serde_json::from_str(obj).map_err(|e| ToolCallParseError::Malformed(e.to_string()))?;
    validate(value)
}

fn validate(value: Value) -> Result<ToolCall, ToolCallParseError> {
    let tool = value
        .get("tool")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ToolCallParseError::MissingTool)?
        .to_string();
    let arguments = match value.get("arguments") {
        None | Some(Value::Null) => return Err(ToolCallParseError::MissingArguments),
        Some(args) => args.clone(),
    };
    Ok(ToolCall { tool, arguments })
}

/// Byte offset of the first `{` whose first key is `"tool"`.
fn find_tool_object(text: &str) -> Option<usize> {
    text.match_indices('{').map(|(i, _)| i).find(|&i| {
        text[i + 1..].trim_start().starts_with("\"tool\"")
    })
}

/// Return the balanced `{ ... }` object starting at byte `start`.
///
/// Braces inside JSON strings are ignored; `\"` and `\\` escapes are
/// honoured. `None` when the object never closes.
pub fn extract_balanced(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
