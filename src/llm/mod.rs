mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

pub use openai::{OpenAiConfig, OpenAiProvider};

/// Speaker of a conversation turn, serialized to the provider's wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One turn of conversation. History is append-only and replayed to the
/// provider verbatim each turn; `name` carries the tool identifier when the
/// role is [`Role::Tool`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

/// Per-token streaming callback. The provider still returns the full
/// accumulated text, so callers of [`ChatProvider::chat`] stay
/// streaming-agnostic.
pub type OnDelta = dyn Fn(&str) + Send + Sync;

/// A single completion request as the run loop hands it to a provider.
pub struct ChatRequest<'a> {
    /// Per-call model override; the adapter resolves its own default when
    /// absent.
    pub model: Option<&'a str>,
    pub messages: &'a [Message],
    pub temperature: f32,
    /// Cooperative cancellation, honored at the request boundary and between
    /// stream chunks.
    pub cancel: Option<&'a CancellationToken>,
    pub on_delta: Option<&'a OnDelta>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatCompletion {
    pub content: String,
}

/// Uniform contract over a model-completion backend. The run loop treats
/// implementations as opaque; a scripted mock is as valid as an HTTP adapter.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatCompletion, ProviderError>;
}
