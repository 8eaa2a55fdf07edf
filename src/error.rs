use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema must be a JSON object")]
    SchemaNotObject,
    #[error("schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("value rejected by schema: {0}")]
    Invalid(String),
    #[error("no JSON value found in output")]
    MissingJson,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
    #[error("provider call cancelled")]
    Cancelled,
}

/// Raised by an input or output guard to reject a conversation.
#[derive(Debug, Error)]
#[error("guard rejected conversation: {0}")]
pub struct GuardError(pub String);

impl GuardError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("structured output rejected: {0}")]
    Output(#[source] SchemaError),
    #[error("agent configuration error: {0}")]
    Config(String),
}
