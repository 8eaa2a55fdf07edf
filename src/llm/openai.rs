use std::future::Future;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::{ChatCompletion, ChatProvider, ChatRequest, Message, OnDelta};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Default model, used when a request carries no override.
    pub model: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    pub max_tokens: Option<u32>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
            max_tokens: None,
        }
    }
}

/// Adapter for OpenAI-compatible `/chat/completions` endpoints implementing
/// [`ChatProvider`], in both plain and SSE-streaming modes.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::Request(
                "api key must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Creates an adapter using `OPENAI_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::Request("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(OpenAiConfig::new(api_key, model))
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<ChatCompletion, ProviderError> {
        let model = request.model.unwrap_or(&self.config.model);
        let streaming = request.on_delta.is_some();
        let body = ChatCompletionRequest {
            model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: self.config.max_tokens,
            stream: streaming,
        };

        debug!(model, streaming, messages = request.messages.len(), "dispatching chat completion");

        let send = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = cancellable(send, request.cancel)
            .await?
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        if let Some(on_delta) = request.on_delta {
            return collect_stream(response, on_delta, request.cancel).await;
        }

        let payload = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        Ok(ChatCompletion {
            content: first_content(payload),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    // Internal messages map 1:1 onto the wire shape (role/content/name).
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<AssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
}

fn first_content(payload: ChatCompletionResponse) -> String {
    payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .unwrap_or_default()
}

async fn cancellable<F, T>(future: F, cancel: Option<&CancellationToken>) -> Result<T, ProviderError>
where
    F: Future<Output = T>,
{
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(ProviderError::Cancelled),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

async fn collect_stream(
    response: reqwest::Response,
    on_delta: &OnDelta,
    cancel: Option<&CancellationToken>,
) -> Result<ChatCompletion, ProviderError> {
    let mut body = Box::pin(response.bytes_stream());
    let mut decoder = SseDecoder::default();
    let mut content = String::new();

    loop {
        let chunk = match cancellable(body.next(), cancel).await? {
            Some(chunk) => chunk.map_err(|err| ProviderError::Request(err.to_string()))?,
            None => break,
        };

        for data in decoder.feed(&String::from_utf8_lossy(&chunk)) {
            if data == "[DONE]" {
                return Ok(ChatCompletion { content });
            }
            let delta = extract_delta(&data)?;
            if !delta.is_empty() {
                content.push_str(&delta);
                on_delta(&delta);
            }
        }
    }

    Ok(ChatCompletion { content })
}

/// Incremental splitter for `data:` lines of an SSE body. Chunks may end
/// mid-line, so a partial tail is buffered until its newline arrives.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }

        payloads
    }
}

fn extract_delta(data: &str) -> Result<String, ProviderError> {
    let chunk = serde_json::from_str::<StreamChunk>(data)
        .map_err(|err| ProviderError::Response(err.to_string()))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default())
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<ApiErrorEnvelope>(&body) {
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());
        return format!("api error {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::llm::Role;

    #[test]
    fn request_body_maps_messages_one_to_one() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Find docs"),
            Message::assistant("{\"tool\":\"lookup\",\"args\":{}}"),
            Message::tool("lookup", "{\"result\":\"ok\"}"),
        ];

        let body = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.2,
            max_tokens: Some(512),
            stream: false,
        };
        let value = serde_json::to_value(&body).expect("serializes");

        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["messages"][1]["content"], "Find docs");
        assert!(value["messages"][1].get("name").is_none());
        assert_eq!(value["messages"][3]["role"], "tool");
        assert_eq!(value["messages"][3]["name"], "lookup");
        assert_eq!(value["max_tokens"], 512);
        assert_eq!(value["stream"], false);
        assert!((value["temperature"].as_f64().unwrap_or_default() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn request_body_omits_absent_max_tokens() {
        let messages = vec![Message::user("hi")];
        let body = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.0,
            max_tokens: None,
            stream: true,
        };
        let value = serde_json::to_value(&body).expect("serializes");

        assert!(value.get("max_tokens").is_none());
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn first_content_tolerates_missing_fields() {
        let empty = ChatCompletionResponse { choices: vec![] };
        assert_eq!(first_content(empty), "");

        let no_content = ChatCompletionResponse {
            choices: vec![Choice {
                message: Some(AssistantMessage { content: None }),
            }],
        };
        assert_eq!(first_content(no_content), "");

        let full = ChatCompletionResponse {
            choices: vec![Choice {
                message: Some(AssistantMessage {
                    content: Some("hello".to_string()),
                }),
            }],
        };
        assert_eq!(first_content(full), "hello");
    }

    #[test]
    fn sse_decoder_reassembles_partial_lines() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.feed("data: {\"a\":").is_empty());
        let payloads = decoder.feed("1}\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_decoder_handles_crlf_and_ignores_other_fields() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.feed("event: message\r\nid: 3\r\ndata: hello\r\n\r\n");
        assert_eq!(payloads, vec!["hello".to_string()]);
    }

    #[test]
    fn extract_delta_reads_incremental_content() {
        let delta =
            extract_delta(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).expect("parses");
        assert_eq!(delta, "Hel");
    }

    #[test]
    fn extract_delta_tolerates_empty_delta() {
        let delta = extract_delta(r#"{"choices":[{"delta":{}}]}"#).expect("parses");
        assert_eq!(delta, "");

        let delta = extract_delta(r#"{"choices":[]}"#).expect("parses");
        assert_eq!(delta, "");
    }

    #[test]
    fn extract_delta_rejects_malformed_payload() {
        assert!(extract_delta("not json").is_err());
    }

    #[test]
    fn construction_rejects_blank_credential() {
        let err = OpenAiProvider::new(OpenAiConfig::new("  ", "gpt-4o-mini"))
            .expect_err("must fail fast");
        match err {
            ProviderError::Request(message) => assert!(message.contains("api key")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn endpoint_honors_base_url_override() {
        let mut config = OpenAiConfig::new("key", "gpt-4o-mini");
        config.api_base_url = Some("https://proxy.example/v1/".to_string());
        let provider = OpenAiProvider::new(config).expect("builds");
        assert_eq!(provider.endpoint(), "https://proxy.example/v1/chat/completions");
    }

    #[test]
    fn message_wire_roles_are_lowercase() {
        let value = serde_json::to_value(Message::tool("calc", "4")).expect("serializes");
        assert_eq!(value["role"], "tool");
        assert_eq!(value["name"], "calc");

        let role: Role = serde_json::from_value(Value::String("assistant".into())).expect("parses");
        assert_eq!(role, Role::Assistant);
    }
}
