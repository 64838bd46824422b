//! Single model call that must come back as a tool call, with corrective
//! retries.

use fl_harness::provider::{LlmProvider, Message, Purpose};
use fl_harness::tool_call::{parse_tool_call_strict, ToolCall};
use tracing::{debug, warn};

use crate::engine::EngineError;

/// A reply that parsed as a tool call.
#[derive(Debug, Clone)]
pub struct ValidatedCall {
    pub call: ToolCall,
    /// The reply text it was parsed from.
    pub raw: String,
    /// 1-based attempt that produced it.
    pub attempts: usize,
}

/// Ask the model for a tool call up to `max_attempts` times. Each rejected
/// reply is appended to the conversation with a correction naming what was
/// wrong. Provider errors are not retried.
pub async fn generate_validated(
    provider: &dyn LlmProvider,
    purpose: Purpose,
    messages: &[Message],
    max_attempts: usize,
) -> Result<ValidatedCall, EngineError> {
    let max_attempts = max_attempts.max(1);
    let mut conversation = messages.to_vec();

    for attempt in 1..=max_attempts {
        let raw = provider
            .generate(purpose, &conversation)
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?;
        match parse_tool_call_strict(&raw) {
            Ok(call) => {
                debug!(attempt, tool = %call.tool, "validated tool call");
                return Ok(ValidatedCall {
                    call,
                    raw,
                    attempts: attempt,
                });
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "reply is not a valid tool call");
                conversation.push(Message::assistant(raw));
                conversation.push(Message::user(format!(
                    "Your reply was rejected: {e}. Respond with exactly one JSON object of the form \
                     {{\"tool\": \"<name>\", \"arguments\": {{...}}}} and nothing else."
                )));
            }
        }
    }
    Err(EngineError::AttemptsExhausted(max_attempts))
}
