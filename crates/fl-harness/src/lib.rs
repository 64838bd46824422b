//! Harness: the execution layer between the agent loop and its external
//! collaborators.
//!
//! - [`provider`]: the opaque "generate text for a purpose" LLM interface
//! - [`tools`]: typed tool registry with schema validation and confirmation
//! - [`tool_call`]: parsing of the `{"tool", "arguments"}` wire format
//! - [`model_pool`]: reference-counted per-purpose model residency

pub mod model_pool;
pub mod provider;
pub mod tool_call;
pub mod tools;
