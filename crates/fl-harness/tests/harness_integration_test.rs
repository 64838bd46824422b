//! Model reply -> parsed call -> validated dispatch, through the public API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use fl_harness::provider::{LlmProvider, Message, Purpose, ScriptedProvider};
use fl_harness::tool_call::parse_tool_call;
use fl_harness::tools::{
    str_arg, Tool, ToolCapabilities, ToolDefinition, ToolError, ToolOutput, ToolRegistry,
};

struct Upper;

#[async_trait]
impl Tool for Upper {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "upper",
            "Uppercase a string",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        )
        .with_capabilities(ToolCapabilities::read_only())
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(str_arg(&arguments, "text")?.to_uppercase()))
    }
}

#[tokio::test]
async fn reply_with_prose_dispatches_to_tool() {
    let provider = ScriptedProvider::new([
        r#"Okay, calling it now: {"tool": "upper", "arguments": {"text": "a{b}c"}} hope that helps"#,
    ]);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Upper));

    let reply = provider
        .generate(Purpose::Code, &[Message::user("shout")])
        .await
        .unwrap();
    let call = parse_tool_call(&reply).expect("tool call");
    let out = registry.execute(&call.tool, call.arguments).await.unwrap();
    assert_eq!(out.content, "A{B}C");
}

#[tokio::test]
async fn wrong_argument_type_is_a_validation_error() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Upper));
    let call = parse_tool_call(r#"{"tool":"upper","arguments":{"text":["x"]}}"#).unwrap();
    let err = registry.execute(&call.tool, call.arguments).await.unwrap_err();
    assert!(matches!(err, ToolError::Validation { ref tool, .. } if tool == "upper"));
}

#[test]
fn definitions_serialize_with_input_schema_key() {
    let def = Upper.definition();
    let v = serde_json::to_value(&def).unwrap();
    assert!(v.get("inputSchema").is_some());
    assert_eq!(v["capabilities"]["read_only"], true);
}
