//! LLM provider abstraction.
//!
//! The orchestration layer treats the model as an opaque "generate text for
//! a purpose" service. Concrete providers (HTTP clients, local inference
//! servers) live outside this workspace and implement [`LlmProvider`].
//!
//! # Example
//!
//! ```rust,no_run
//! use fl_harness::provider::{LlmProvider, Message, ProviderError, Purpose};
//!
//! async fn example(provider: impl LlmProvider) -> Result<(), ProviderError> {
//!     let messages = vec![
//!         Message::system("Respond with a single JSON tool call."),
//!         Message::user("Write a hello world program in Go."),
//!     ];
//!     let reply = provider.generate(Purpose::Code, &messages).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Provider is not properly configured (missing credentials, no model).
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Purpose
// ---------------------------------------------------------------------------

/// What a model call is for. Each purpose maps to one resident model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Chat,
    Code,
    Analysis,
}

impl Purpose {
    pub const ALL: [Purpose; 3] = [Purpose::Chat, Purpose::Code, Purpose::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Chat => "chat",
            Purpose::Code => "code",
            Purpose::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Purpose::Chat),
            "code" => Ok(Purpose::Code),
            "analysis" => Ok(Purpose::Analysis),
            other => Err(ProviderError::Other(format!("unknown purpose: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The role of a participant in an LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions that set context and behaviour.
    System,
    /// Input from the caller. Tool results are fed back as user turns.
    User,
    /// Previous model output.
    Assistant,
}

/// A single message in an LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Unified interface for LLM text generation.
///
/// Implementations must be `Send + Sync` so one provider can be shared by
/// every worker in the pool.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Generate the next assistant reply for `messages` using the model
    /// assigned to `purpose`.
    async fn generate(&self, purpose: Purpose, messages: &[Message])
        -> Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// StubProvider: returns an error for every call.
// ---------------------------------------------------------------------------

/// Placeholder provider used when no model backend is configured.
#[derive(Debug, Clone)]
pub struct StubProvider {
    name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _purpose: Purpose,
        _messages: &[Message],
    ) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} has no model backend",
            self.name
        )))
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider: replays canned replies in order.
// ---------------------------------------------------------------------------

/// Provider that replays a fixed list of replies and records every request.
///
/// Used for dry runs and deterministic tests of the execution loop. Once the
/// script is exhausted every call fails with [`ProviderError::Other`].
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Messages sent on every call, oldest first.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _purpose: Purpose,
        messages: &[Message],
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ProviderError::Other("script exhausted".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_is_not_configured() {
        let p = StubProvider::new("none");
        let err = p.generate(Purpose::Chat, &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let p = ScriptedProvider::new(["one", "two"]);
        let msgs = vec![Message::user("hi")];
        assert_eq!(p.generate(Purpose::Code, &msgs).await.unwrap(), "one");
        assert_eq!(p.generate(Purpose::Code, &msgs).await.unwrap(), "two");
        assert!(p.generate(Purpose::Code, &msgs).await.is_err());
        assert_eq!(p.call_count(), 3);
        assert_eq!(p.calls()[0][0].content, "hi");
    }

    #[test]
    fn purpose_parses_case_insensitively() {
        assert_eq!("Code".parse::<Purpose>().unwrap(), Purpose::Code);
        assert!("vision".parse::<Purpose>().is_err());
    }
}
