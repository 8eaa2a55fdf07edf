//! Conversational agent run loop for Rust.
//!
//! v0 surface:
//! - `Agent` run loop with text-embedded tool directives, handoffs, and
//!   input/output guards
//! - `TraceEvent` observer hook across all seven observation points
//! - Tool registry with name-keyed merge, argument schemas, and a shared
//!   per-run `ToolContext`
//! - Structured output via an opaque `Schema` boundary
//! - OpenAI-compatible chat-completions adapter, plain or SSE streaming

pub mod agent;
pub mod error;
pub mod llm;
pub mod schema;
pub mod tools;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, DEFAULT_MAX_TOOL_PASSES, DEFAULT_TEMPERATURE, Directive,
    RunRequest, RunResult, TraceEvent, parse_directive, run,
};
pub use error::{AgentError, GuardError, ProviderError, SchemaError, ToolError};
pub use llm::{
    ChatCompletion, ChatProvider, ChatRequest, Message, OnDelta, OpenAiConfig, OpenAiProvider,
    Role,
};
pub use schema::{JsonSchema, Schema};
pub use tools::{ToolContext, ToolDef, ToolSet, maybe_execute_tool, merge_tools, tool_set};
